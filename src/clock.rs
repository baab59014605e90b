use std::time::Duration;

use async_trait::async_trait;

use crate::model::Ms;

/// Time source for everything that compares against "now" or waits.
/// Injected so retry backoff and trip windows can be tested without a real clock.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `SystemTime` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub(crate) use manual::{ManualClock, PausedClock};
