use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::engine::Engine;
use crate::mailer::RecipientCache;
use crate::observability::{RECIPIENT_CACHE_ENTRIES, TRIPS_COMPLETED_TOTAL};

const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Complete every confirmed trip whose end has passed. Returns how many were completed.
pub async fn complete_finished(engine: &Engine) -> usize {
    let now = engine.now_ms();
    let mut completed = 0;
    for id in engine.collect_finished(now).await {
        match engine.complete_reservation(id).await {
            Ok(_) => {
                completed += 1;
                metrics::counter!(TRIPS_COMPLETED_TOTAL).increment(1);
                info!(reservation_id = %id, "trip completed");
            }
            // Canceled or deleted between the sweep and the transition.
            Err(e) => debug!(reservation_id = %id, "completion skipped: {e}"),
        }
    }
    completed
}

/// Background task that periodically completes finished trips.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        complete_finished(&engine).await;
    }
    debug!("completion sweep stopped");
}

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
    debug!("compactor stopped");
}

/// Background task that evicts expired audiences from the recipient cache. Mailings
/// fire once, so most entries are never looked up again after they expire.
pub async fn run_cache_sweeper(
    cache: Arc<RecipientCache>,
    clock: Arc<dyn Clock>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let evicted = cache.purge_expired(clock.now_ms());
        metrics::gauge!(RECIPIENT_CACHE_ENTRIES).set(cache.len() as f64);
        if evicted > 0 {
            debug!(evicted, remaining = cache.len(), "recipient cache swept");
        }
    }
    debug!("cache sweeper stopped");
}
