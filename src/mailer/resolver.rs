use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::model::Ms;

/// Source of truth for who is opted in to a mailing.
#[async_trait]
pub trait SubscriberSource: Send + Sync {
    async fn subscribers(&self, mailing_id: Ulid) -> Result<Vec<String>, EngineError>;
}

#[async_trait]
impl SubscriberSource for Engine {
    async fn subscribers(&self, mailing_id: Ulid) -> Result<Vec<String>, EngineError> {
        self.active_subscribers(&mailing_id).await
    }
}

#[derive(Debug, Clone)]
struct CachedRecipients {
    recipients: Arc<Vec<String>>,
    expires_at: Ms,
}

/// Advisory TTL cache of resolved audiences, shared by every batch of a mailing.
/// Concurrent fills for the same mailing are last-writer-wins.
#[derive(Debug)]
pub struct RecipientCache {
    ttl_ms: Ms,
    entries: DashMap<Ulid, CachedRecipients>,
}

impl RecipientCache {
    pub fn new(ttl_ms: Ms) -> Self {
        Self {
            ttl_ms,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, mailing_id: &Ulid, now: Ms) -> Option<Arc<Vec<String>>> {
        let entry = self.entries.get(mailing_id)?;
        if entry.expires_at > now {
            return Some(entry.recipients.clone());
        }
        drop(entry);
        self.entries.remove_if(mailing_id, |_, e| e.expires_at <= now);
        None
    }

    pub fn put(&self, mailing_id: Ulid, recipients: Arc<Vec<String>>, now: Ms) {
        self.entries.insert(
            mailing_id,
            CachedRecipients {
                recipients,
                expires_at: now.saturating_add(self.ttl_ms),
            },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self, now: Ms) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves a mailing to its current audience, going to the subscriber source only
/// on a cache miss or expiry.
pub struct RecipientResolver {
    source: Arc<dyn SubscriberSource>,
    cache: Arc<RecipientCache>,
    clock: Arc<dyn Clock>,
}

impl RecipientResolver {
    pub fn new(source: Arc<dyn SubscriberSource>, cache: Arc<RecipientCache>, clock: Arc<dyn Clock>) -> Self {
        Self { source, cache, clock }
    }

    pub async fn resolve(&self, mailing_id: Ulid) -> Result<Arc<Vec<String>>, EngineError> {
        let now = self.clock.now_ms();
        if let Some(hit) = self.cache.get(&mailing_id, now) {
            metrics::counter!(crate::observability::RECIPIENT_LOOKUPS_TOTAL, "source" => "cache").increment(1);
            return Ok(hit);
        }
        metrics::counter!(crate::observability::RECIPIENT_LOOKUPS_TOTAL, "source" => "store").increment(1);

        let recipients = Arc::new(self.source.subscribers(mailing_id).await?);
        // An empty audience is not cached so a late opt-in is seen on the next lookup.
        if !recipients.is_empty() {
            self.cache.put(mailing_id, recipients.clone(), now);
        }
        tracing::debug!(%mailing_id, count = recipients.len(), "resolved recipients");
        Ok(recipients)
    }

    pub fn cache(&self) -> &RecipientCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;

    /// Counts store hits; returns whatever list it was built with.
    struct CountingSource {
        calls: AtomicUsize,
        recipients: Vec<String>,
    }

    impl CountingSource {
        fn new(recipients: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                recipients: recipients.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl SubscriberSource for CountingSource {
        async fn subscribers(&self, _mailing_id: Ulid) -> Result<Vec<String>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.recipients.clone())
        }
    }

    fn resolver(source: Arc<CountingSource>, clock: Arc<ManualClock>, ttl: Ms) -> RecipientResolver {
        RecipientResolver::new(source, Arc::new(RecipientCache::new(ttl)), clock)
    }

    #[tokio::test]
    async fn repeat_lookup_within_ttl_skips_the_store() {
        let source = Arc::new(CountingSource::new(&["a@x.io", "b@x.io"]));
        let clock = Arc::new(ManualClock::at(1_000));
        let resolver = resolver(source.clone(), clock.clone(), 600_000);
        let id = Ulid::new();

        let first = resolver.resolve(id).await.unwrap();
        clock.advance(599_999);
        let second = resolver.resolve(id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiry_recomputes() {
        let source = Arc::new(CountingSource::new(&["a@x.io"]));
        let clock = Arc::new(ManualClock::at(1_000));
        let resolver = resolver(source.clone(), clock.clone(), 10_000);
        let id = Ulid::new();

        resolver.resolve(id).await.unwrap();
        clock.advance(10_000);
        resolver.resolve(id).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_audience_is_not_cached() {
        let source = Arc::new(CountingSource::new(&[]));
        let clock = Arc::new(ManualClock::at(1_000));
        let resolver = resolver(source.clone(), clock, 600_000);
        let id = Ulid::new();

        assert!(resolver.resolve(id).await.unwrap().is_empty());
        assert!(resolver.resolve(id).await.unwrap().is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn mailings_are_cached_separately() {
        let source = Arc::new(CountingSource::new(&["a@x.io"]));
        let clock = Arc::new(ManualClock::at(1_000));
        let resolver = resolver(source.clone(), clock, 600_000);

        resolver.resolve(Ulid::new()).await.unwrap();
        resolver.resolve(Ulid::new()).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cache().len(), 2);
    }

    #[test]
    fn purge_drops_only_expired() {
        let cache = RecipientCache::new(100);
        cache.put(Ulid::new(), Arc::new(vec!["a@x.io".into()]), 0);
        cache.put(Ulid::new(), Arc::new(vec!["b@x.io".into()]), 50);
        assert_eq!(cache.purge_expired(120), 1);
        assert_eq!(cache.len(), 1);
    }
}
