use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{CounterBackend, CounterBackendKind, CounterKey, WindowUsage};
use crate::error::{Error, ErrorDetails};

/// Expired entries are swept after this many increments.
const PURGE_EVERY: u64 = 1024;

#[derive(Clone, Copy, Debug)]
struct Entry {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Process-local fast backend with the same expiry rules as Redis: the first
/// increment of a key attaches a TTL of one window, later increments keep it.
#[derive(Debug)]
pub struct InMemoryCounterBackend {
    counters: DashMap<String, Entry>,
    healthy: AtomicBool,
    increments: AtomicU64,
}

impl Default for InMemoryCounterBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterBackend {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            healthy: AtomicBool::new(true),
            increments: AtomicU64::new(0),
        }
    }

    /// Simulates the store becoming unreachable.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) {
        self.counters.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn ensure_healthy(&self) -> Result<(), Error> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::BackendUnavailable {
                backend: CounterBackendKind::InMemory.to_string(),
                message: "in-memory counters are marked unhealthy".to_string(),
            }))
        }
    }
}

#[async_trait]
impl CounterBackend for InMemoryCounterBackend {
    fn kind(&self) -> CounterBackendKind {
        CounterBackendKind::InMemory
    }

    async fn increment(
        &self,
        key: &CounterKey<'_>,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, Error> {
        self.ensure_healthy()?;
        let expires_at = now + key.window.duration();
        let usage = {
            let mut entry = self
                .counters
                .entry(key.storage_key())
                .or_insert(Entry {
                    count: 0,
                    expires_at,
                });
            if entry.expires_at <= now {
                *entry = Entry {
                    count: 0,
                    expires_at,
                };
            }
            entry.count += 1;
            WindowUsage {
                count: entry.count,
                resets_at: Some(entry.expires_at),
            }
        };
        if self.increments.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now);
        }
        Ok(usage)
    }

    async fn read(&self, key: &CounterKey<'_>, now: DateTime<Utc>) -> Result<WindowUsage, Error> {
        self.ensure_healthy()?;
        Ok(match self.counters.get(&key.storage_key()) {
            Some(entry) if entry.expires_at > now => WindowUsage {
                count: entry.count,
                resets_at: Some(entry.expires_at),
            },
            _ => WindowUsage::empty(),
        })
    }

    async fn health(&self) -> Result<(), Error> {
        self.ensure_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Feature, WindowKind};
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        "2024-05-10T09:30:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_ttl_attached_on_first_increment_only() {
        let backend = InMemoryCounterBackend::new();
        let key = CounterKey::new("user-1", Feature::CoverLetter, WindowKind::Hourly);

        let first = backend.increment(&key, now()).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.resets_at, Some(now() + TimeDelta::hours(1)));

        let second = backend
            .increment(&key, now() + TimeDelta::minutes(20))
            .await
            .unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.resets_at, first.resets_at);
    }

    #[tokio::test]
    async fn test_read_does_not_create_counter() {
        let backend = InMemoryCounterBackend::new();
        let key = CounterKey::new("user-1", Feature::CoverLetter, WindowKind::Daily);
        assert_eq!(backend.read(&key, now()).await.unwrap(), WindowUsage::empty());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_counter_expires_after_window() {
        let backend = InMemoryCounterBackend::new();
        let key = CounterKey::new("user-1", Feature::CareerAdvice, WindowKind::Hourly);
        backend.increment(&key, now()).await.unwrap();
        backend.increment(&key, now()).await.unwrap();

        let later = now() + TimeDelta::hours(1);
        assert_eq!(backend.read(&key, later).await.unwrap().count, 0);

        let restarted = backend.increment(&key, later).await.unwrap();
        assert_eq!(restarted.count, 1);
        assert_eq!(restarted.resets_at, Some(later + TimeDelta::hours(1)));

        backend.purge_expired(later + TimeDelta::hours(2));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let backend = std::sync::Arc::new(InMemoryCounterBackend::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let key = CounterKey::new("user-1", Feature::JobFitAnalysis, WindowKind::Daily);
                backend.increment(&key, now()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let key = CounterKey::new("user-1", Feature::JobFitAnalysis, WindowKind::Daily);
        assert_eq!(backend.read(&key, now()).await.unwrap().count, 50);
    }

    #[tokio::test]
    async fn test_unhealthy_backend_reports_backend_failure() {
        let backend = InMemoryCounterBackend::new();
        backend.set_healthy(false);
        let key = CounterKey::new("user-1", Feature::CoverLetter, WindowKind::Hourly);
        let err = backend.read(&key, now()).await.unwrap_err();
        assert!(err.is_backend_failure());
        assert!(backend.increment(&key, now()).await.is_err());
    }
}
