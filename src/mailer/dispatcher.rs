use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::observability::*;

use super::resolver::RecipientResolver;
use super::transport::{DeliveryError, Message, Transport};

/// Delay before re-sending a batch after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(retry - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub batch_size: usize,
    /// Total tries per batch, first send included.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Batches of one mailing in flight at once.
    pub concurrency: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(60)),
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub index: usize,
    pub size: usize,
    pub delivered: usize,
    pub attempts: u32,
    /// Addresses the transport rejected outright.
    pub permanent_failures: Vec<String>,
    /// Addresses still unsent when the retry budget ran out.
    pub exhausted: Vec<String>,
    /// Stopped early because the job was revoked.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every batch was attempted; per-address failures are in the batch reports.
    Dispatched,
    NoRecipients,
    Cancelled,
}

/// A mailing's message and audience, fixed before the first batch is submitted.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub mailing_id: Ulid,
    pub message: Message,
    pub recipients: Arc<Vec<String>>,
}

impl DispatchPlan {
    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub mailing_id: Ulid,
    pub batches: Vec<BatchReport>,
    pub outcome: DispatchOutcome,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.batches.iter().map(|b| b.delivered).sum()
    }

    pub fn failed_recipients(&self) -> Vec<String> {
        self.batches
            .iter()
            .flat_map(|b| b.permanent_failures.iter().chain(&b.exhausted))
            .cloned()
            .collect()
    }
}

/// Splits a mailing's audience into fixed-size batches and drives each through a
/// bounded retry loop. Batches are independent: one failing never stops the others.
pub struct BatchDispatcher {
    engine: Arc<Engine>,
    resolver: Arc<RecipientResolver>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    policy: DispatchPolicy,
}

impl BatchDispatcher {
    pub fn new(
        engine: Arc<Engine>,
        resolver: Arc<RecipientResolver>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            engine,
            resolver,
            transport,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Resolve the audience and send the mailing to it. Does not mark the mailing sent.
    pub async fn dispatch(
        &self,
        mailing_id: Ulid,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, EngineError> {
        match self.plan(mailing_id).await? {
            Some(plan) => Ok(self.send(plan, cancel).await),
            None => Ok(DispatchReport {
                mailing_id,
                batches: Vec::new(),
                outcome: DispatchOutcome::NoRecipients,
            }),
        }
    }

    /// Snapshot the message and resolve its audience. `None` means nobody is opted in;
    /// the skip is recorded on the mailing.
    pub async fn plan(&self, mailing_id: Ulid) -> Result<Option<DispatchPlan>, EngineError> {
        let mailing = self
            .engine
            .get_mailing(&mailing_id)
            .await
            .ok_or(EngineError::NotFound(mailing_id))?;
        let recipients = self.resolver.resolve(mailing_id).await?;

        if recipients.is_empty() {
            info!(%mailing_id, "no recipients; dispatch skipped");
            self.engine
                .record_dispatch_skipped(mailing_id, "no recipients")
                .await?;
            return Ok(None);
        }

        Ok(Some(DispatchPlan {
            mailing_id,
            message: Message {
                subject: mailing.subject,
                body: mailing.body,
            },
            recipients,
        }))
    }

    /// Submit every batch of the plan and wait for them to settle.
    pub async fn send(&self, plan: DispatchPlan, cancel: &CancellationToken) -> DispatchReport {
        let DispatchPlan {
            mailing_id,
            message,
            recipients,
        } = plan;
        let batch_size = self.policy.batch_size.max(1);
        let batch_count = recipients.len().div_ceil(batch_size);
        info!(%mailing_id, recipients = recipients.len(), batches = batch_count, "dispatching");

        let pending: Vec<_> = recipients
            .chunks(batch_size)
            .enumerate()
            .map(|(index, batch)| self.send_batch(mailing_id, index, batch, &message, cancel))
            .collect();
        let mut batches: Vec<BatchReport> = stream::iter(pending)
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;
        batches.sort_by_key(|b| b.index);

        let outcome = if batches.iter().any(|b| b.cancelled) {
            DispatchOutcome::Cancelled
        } else {
            DispatchOutcome::Dispatched
        };
        DispatchReport {
            mailing_id,
            batches,
            outcome,
        }
    }

    /// Deliver one batch. Progress is tracked per address: a retry resumes at the
    /// first address that has not been attempted yet, so nobody is mailed twice.
    pub async fn send_batch(
        &self,
        mailing_id: Ulid,
        index: usize,
        batch: &[String],
        message: &Message,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport {
            index,
            size: batch.len(),
            ..BatchReport::default()
        };
        metrics::counter!(BATCHES_SENT_TOTAL).increment(1);
        let mut cursor = 0;

        'attempts: loop {
            report.attempts += 1;
            while cursor < batch.len() {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'attempts;
                }
                let addr = &batch[cursor];
                match self.transport.send(addr, message).await {
                    Ok(()) => {
                        report.delivered += 1;
                        metrics::counter!(DELIVERIES_TOTAL, "result" => "ok").increment(1);
                    }
                    Err(DeliveryError::Permanent(reason)) => {
                        warn!(%mailing_id, batch = index, %addr, %reason, "permanent delivery failure");
                        report.permanent_failures.push(addr.clone());
                        metrics::counter!(DELIVERIES_TOTAL, "result" => "permanent").increment(1);
                    }
                    Err(DeliveryError::Transient(reason)) => {
                        warn!(
                            %mailing_id,
                            batch = index,
                            attempt = report.attempts,
                            remaining = batch.len() - cursor,
                            %reason,
                            "transient delivery failure"
                        );
                        break;
                    }
                }
                cursor += 1;
            }

            if cursor == batch.len() {
                break;
            }
            if report.attempts >= self.policy.max_attempts {
                report.exhausted = batch[cursor..].to_vec();
                metrics::counter!(DELIVERIES_TOTAL, "result" => "exhausted")
                    .increment(report.exhausted.len() as u64);
                error!(
                    %mailing_id,
                    batch = index,
                    attempts = report.attempts,
                    failed = ?report.exhausted,
                    "retries exhausted"
                );
                break;
            }

            let delay = self.policy.backoff.delay(report.attempts);
            debug!(%mailing_id, batch = index, ?delay, "retrying batch");
            metrics::counter!(DELIVERY_RETRIES_TOTAL).increment(1);
            tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = self.clock.sleep(delay) => {}
            }
        }

        let failed: Vec<String> = report
            .permanent_failures
            .iter()
            .chain(&report.exhausted)
            .cloned()
            .collect();
        if let Err(e) = self.engine.record_failed_recipients(mailing_id, failed).await {
            error!(%mailing_id, batch = index, "could not record failed recipients: {e}");
        }
        report
    }
}
