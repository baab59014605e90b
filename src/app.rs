use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::config::Config;
use crate::engine::Engine;
use crate::mailer::{BatchDispatcher, JobController, RecipientCache, RecipientResolver, TokioScheduler, Transport};
use crate::notify::NotifyHub;
use crate::reaper;
use crate::reminder::ReminderScanner;
use crate::wire::ConvoyHandler;

/// A running convoy instance: engine, mailer and background loops.
pub struct App {
    pub engine: Arc<Engine>,
    pub jobs: Arc<JobController>,
    pub handler: Arc<ConvoyHandler>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Replay the WAL, re-arm unsent mailings and spawn the background loops.
    pub async fn start(
        config: &Config,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(config.wal_path(), notify, clock.clone())?);

        let cache = Arc::new(RecipientCache::new(config.recipient_cache_ttl_ms));
        let resolver = Arc::new(RecipientResolver::new(engine.clone(), cache.clone(), clock.clone()));
        let dispatcher = Arc::new(BatchDispatcher::new(
            engine.clone(),
            resolver,
            transport.clone(),
            clock.clone(),
            config.dispatch.clone(),
        ));
        let jobs = Arc::new(JobController::new(
            engine.clone(),
            dispatcher,
            Arc::new(TokioScheduler::new(clock.clone())),
        ));
        let armed = jobs.restore().await?;

        let shutdown = CancellationToken::new();
        let sweep_period = Duration::from_millis(config.recipient_cache_ttl_ms.max(1_000) as u64);
        let scanner = ReminderScanner::new(engine.clone(), transport, clock.clone(), config.reminder_window_ms);
        let tasks = vec![
            tokio::spawn(scanner.run(config.reminder_period, shutdown.clone())),
            tokio::spawn(reaper::run_reaper(
                engine.clone(),
                config.completion_period,
                shutdown.clone(),
            )),
            tokio::spawn(reaper::run_compactor(
                engine.clone(),
                config.compact_threshold,
                shutdown.clone(),
            )),
            tokio::spawn(reaper::run_cache_sweeper(cache, clock, sweep_period, shutdown.clone())),
        ];

        info!(
            wal = %config.wal_path().display(),
            armed,
            "convoy started"
        );
        let handler = Arc::new(ConvoyHandler::new(engine.clone(), jobs.clone()));
        Ok(Self {
            engine,
            jobs,
            handler,
            shutdown,
            tasks,
        })
    }

    /// Stop the background loops and wait for them. Armed mailing jobs are dropped with
    /// the runtime and re-armed from the WAL on the next start.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {e}");
            }
        }
        info!("background loops stopped");
    }
}
