use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::*;

use super::dispatcher::{BatchDispatcher, DispatchOutcome};

/// Work run when a scheduled job fires. The token is cancelled if the job is revoked
/// while it is still running.
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// One-shot timer service. Revoking is best effort: a job already running is asked
/// to stop through its token and may still finish what it was doing.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, handle: JobHandle, at: Ms, job: Job);
    /// Returns whether the handle was still pending or running. Unknown handles are a no-op.
    fn revoke(&self, handle: JobHandle) -> bool;
    fn pending(&self) -> usize;
}

/// Runs each job as a Tokio task that sleeps until its instant.
pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
    jobs: Arc<DashMap<JobHandle, CancellationToken>>,
}

impl TokioScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: Arc::new(DashMap::new()),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, handle: JobHandle, at: Ms, job: Job) {
        let token = CancellationToken::new();
        self.jobs.insert(handle, token.clone());
        metrics::gauge!(JOBS_ARMED).set(self.jobs.len() as f64);

        let jobs = self.jobs.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let wait = (at - clock.now_ms()).max(0) as u64;
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(%handle, "job revoked before firing");
                    return;
                }
                _ = clock.sleep(Duration::from_millis(wait)) => {}
            }
            job(token.clone()).await;
            jobs.remove(&handle);
            metrics::gauge!(JOBS_ARMED).set(jobs.len() as f64);
        });
    }

    fn revoke(&self, handle: JobHandle) -> bool {
        match self.jobs.remove(&handle) {
            Some((_, token)) => {
                token.cancel();
                metrics::gauge!(JOBS_ARMED).set(self.jobs.len() as f64);
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> usize {
        self.jobs.len()
    }
}

/// Keeps each unsent mailing armed for exactly one future firing and records the
/// live handle on the mailing so edits and deletes can revoke it.
pub struct JobController {
    engine: Arc<Engine>,
    dispatcher: Arc<BatchDispatcher>,
    scheduler: Arc<dyn Scheduler>,
}

impl JobController {
    pub fn new(engine: Arc<Engine>, dispatcher: Arc<BatchDispatcher>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            engine,
            dispatcher,
            scheduler,
        }
    }

    /// Schedule the mailing if its send time is still ahead. An existing handle is
    /// revoked first, so arming twice never yields two firings.
    pub async fn arm(&self, mailing_id: Ulid) -> Result<Option<JobHandle>, EngineError> {
        let mailing = self
            .engine
            .get_mailing(&mailing_id)
            .await
            .ok_or(EngineError::NotFound(mailing_id))?;
        if mailing.is_sent {
            return Ok(None);
        }
        if let Some(old) = mailing.job_handle {
            self.scheduler.revoke(old);
        }
        if mailing.send_time <= self.engine.now_ms() {
            if mailing.job_handle.is_some() {
                self.engine.set_job_handle(mailing_id, None).await?;
            }
            debug!(%mailing_id, send_time = mailing.send_time, "send time passed; not armed");
            return Ok(None);
        }

        let handle = JobHandle::new();
        // Recorded before scheduling so the firing job always finds its own handle.
        self.engine.set_job_handle(mailing_id, Some(handle)).await?;
        let engine = self.engine.clone();
        let dispatcher = self.dispatcher.clone();
        self.scheduler.schedule(
            handle,
            mailing.send_time,
            Box::new(move |cancel| fire(engine, dispatcher, mailing_id, handle, cancel).boxed()),
        );
        info!(%mailing_id, %handle, send_time = mailing.send_time, "mailing armed");
        Ok(Some(handle))
    }

    /// Replace the pending firing after an edit. A send time moved into the past
    /// leaves the mailing disarmed.
    pub async fn rearm(&self, mailing_id: Ulid) -> Result<Option<JobHandle>, EngineError> {
        self.arm(mailing_id).await
    }

    /// Revoke the pending firing without a replacement.
    pub async fn disarm(&self, mailing_id: Ulid) -> Result<(), EngineError> {
        let Some(mailing) = self.engine.get_mailing(&mailing_id).await else {
            return Ok(());
        };
        if let Some(handle) = mailing.job_handle {
            if self.scheduler.revoke(handle) {
                info!(%mailing_id, %handle, "mailing disarmed");
            }
            self.engine.set_job_handle(mailing_id, None).await?;
        }
        Ok(())
    }

    pub async fn create_mailing(&self, new: NewMailing) -> Result<Mailing, EngineError> {
        let mailing = self.engine.create_mailing(new).await?;
        self.arm(mailing.id).await?;
        self.current(mailing.id).await
    }

    pub async fn update_mailing(&self, id: Ulid, patch: MailingPatch) -> Result<Mailing, EngineError> {
        self.engine.update_mailing(id, patch).await?;
        self.rearm(id).await?;
        self.current(id).await
    }

    pub async fn delete_mailing(&self, id: Ulid) -> Result<Mailing, EngineError> {
        self.disarm(id).await?;
        self.engine.delete_mailing(id).await
    }

    /// Re-arm every unsent mailing after a restart; handles from the previous
    /// process are meaningless now. Returns how many were armed.
    pub async fn restore(&self) -> Result<usize, EngineError> {
        let mut armed = 0;
        for mailing in self.engine.pending_mailings().await {
            if self.arm(mailing.id).await?.is_some() {
                armed += 1;
            }
        }
        info!(armed, "restored scheduled mailings");
        Ok(armed)
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    async fn current(&self, id: Ulid) -> Result<Mailing, EngineError> {
        self.engine.get_mailing(&id).await.ok_or(EngineError::NotFound(id))
    }
}

/// Body of a scheduled job. Stale or superseded firings do nothing.
async fn fire(
    engine: Arc<Engine>,
    dispatcher: Arc<BatchDispatcher>,
    mailing_id: Ulid,
    handle: JobHandle,
    cancel: CancellationToken,
) {
    let Some(mailing) = engine.get_mailing(&mailing_id).await else {
        debug!(%mailing_id, %handle, "mailing deleted; firing dropped");
        return;
    };
    if mailing.is_sent {
        debug!(%mailing_id, %handle, "already sent; firing dropped");
        return;
    }
    if mailing.job_handle != Some(handle) {
        warn!(%mailing_id, %handle, current = ?mailing.job_handle, "stale job fired; ignoring");
        return;
    }

    let plan = match dispatcher.plan(mailing_id).await {
        Ok(Some(plan)) => plan,
        Ok(None) => {
            metrics::counter!(MAILINGS_FIRED_TOTAL, "outcome" => "skipped").increment(1);
            clear_handle(&engine, mailing_id, handle).await;
            return;
        }
        Err(e) => {
            error!(%mailing_id, %handle, "dispatch failed: {e}");
            metrics::counter!(MAILINGS_FIRED_TOTAL, "outcome" => "error").increment(1);
            clear_handle(&engine, mailing_id, handle).await;
            return;
        }
    };
    if cancel.is_cancelled() {
        info!(%mailing_id, %handle, "revoked before submission");
        metrics::counter!(MAILINGS_FIRED_TOTAL, "outcome" => "cancelled").increment(1);
        return;
    }

    // Sent means submitted: from here on an edit no longer revokes this job.
    if let Err(e) = engine.mark_mailing_sent(mailing_id).await {
        error!(%mailing_id, "could not mark mailing sent: {e}");
        metrics::counter!(MAILINGS_FIRED_TOTAL, "outcome" => "error").increment(1);
        return;
    }
    let recipients = plan.recipient_count();
    let report = dispatcher.send(plan, &cancel).await;
    match report.outcome {
        DispatchOutcome::Cancelled => {
            info!(%mailing_id, %handle, delivered = report.delivered(), "dispatch stopped by revoke");
            metrics::counter!(MAILINGS_FIRED_TOTAL, "outcome" => "cancelled").increment(1);
            return;
        }
        DispatchOutcome::Dispatched | DispatchOutcome::NoRecipients => {
            info!(
                %mailing_id,
                recipients,
                delivered = report.delivered(),
                failed = report.failed_recipients().len(),
                "mailing dispatched"
            );
            metrics::counter!(MAILINGS_FIRED_TOTAL, "outcome" => "dispatched").increment(1);
        }
    }

    clear_handle(&engine, mailing_id, handle).await;
}

async fn clear_handle(engine: &Engine, mailing_id: Ulid, handle: JobHandle) {
    if let Err(e) = engine.clear_job_handle(mailing_id, handle).await {
        debug!(%mailing_id, "could not clear job handle: {e}");
    }
}
