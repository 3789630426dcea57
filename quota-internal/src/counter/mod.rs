//! Windowed usage counters.
//!
//! A deployment has at most one fast backend (Redis, or the process-local map) and
//! always a durable backend that counts rows in the usage log. Reads go to the fast
//! backend first and fall back to the durable one when it fails; increments only
//! ever touch the fast backend, since the usage log is advanced by the recorder.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strum::{AsRefStr, Display};

use crate::config_parser::CounterBackendMode;
use crate::db::postgres::PostgresConnectionInfo;
use crate::error::{Error, ErrorDetails};
use crate::observability::QuotaMetrics;
use crate::redis_client::RedisConnectionInfo;
use crate::types::{Feature, WindowKind};

pub mod durable;
pub mod memory;
pub mod redis_backend;

pub use durable::DurableCounterBackend;
pub use memory::InMemoryCounterBackend;
pub use redis_backend::RedisCounterBackend;

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum CounterBackendKind {
    Redis,
    InMemory,
    Durable,
}

/// Identifies one counter: a user's usage of a feature within one window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CounterKey<'a> {
    pub user_id: &'a str,
    pub feature: Feature,
    pub window: WindowKind,
}

impl<'a> CounterKey<'a> {
    pub fn new(user_id: &'a str, feature: Feature, window: WindowKind) -> Self {
        Self {
            user_id,
            feature,
            window,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("ai_usage:{}:{}:{}", self.user_id, self.feature, self.window)
    }
}

/// Current state of one counter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WindowUsage {
    pub count: u64,
    /// When the counter drops back to zero; `None` if there is nothing to expire
    pub resets_at: Option<DateTime<Utc>>,
}

impl WindowUsage {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait CounterBackend: Send + Sync {
    fn kind(&self) -> CounterBackendKind;

    /// Adds one to the counter, attaching the window's expiry if the counter has none.
    async fn increment(&self, key: &CounterKey<'_>, now: DateTime<Utc>)
        -> Result<WindowUsage, Error>;

    /// Reads the counter without creating it.
    async fn read(&self, key: &CounterKey<'_>, now: DateTime<Utc>) -> Result<WindowUsage, Error>;

    async fn health(&self) -> Result<(), Error>;
}

/// The counter backends selected for this process.
#[derive(Clone)]
pub struct CounterBackends {
    fast: Option<Arc<dyn CounterBackend>>,
    durable: Arc<dyn CounterBackend>,
    metrics: Arc<QuotaMetrics>,
}

impl std::fmt::Debug for CounterBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterBackends")
            .field("fast", &self.fast.as_ref().map(|b| b.kind()))
            .field("durable", &self.durable.kind())
            .finish()
    }
}

impl CounterBackends {
    pub fn new(
        fast: Option<Arc<dyn CounterBackend>>,
        durable: Arc<dyn CounterBackend>,
        metrics: Arc<QuotaMetrics>,
    ) -> Self {
        Self {
            fast,
            durable,
            metrics,
        }
    }

    /// Picks the backends once at start.
    ///
    /// - `Auto`: Redis if it answered the start-up probe, otherwise the durable log.
    ///   Without Postgres either, counters are kept in process memory.
    /// - `Fast`: Redis, or an error if it is not available.
    /// - `Durable`: the usage log only, or an error if Postgres is disabled.
    /// - `InMemory`: process-local counters.
    pub fn new_from_connections(
        mode: CounterBackendMode,
        redis_connection_info: &RedisConnectionInfo,
        postgres_connection_info: &PostgresConnectionInfo,
        metrics: Arc<QuotaMetrics>,
    ) -> Result<Self, Error> {
        let durable: Arc<dyn CounterBackend> = Arc::new(DurableCounterBackend::new(Arc::new(
            postgres_connection_info.clone(),
        )));
        let redis_backend = match redis_connection_info {
            RedisConnectionInfo::Enabled { connection } => Some(Arc::new(
                RedisCounterBackend::new(connection.clone()),
            ) as Arc<dyn CounterBackend>),
            RedisConnectionInfo::Disabled => None,
        };
        let postgres_available = postgres_connection_info.is_enabled();

        let fast = match mode {
            CounterBackendMode::Fast => {
                if redis_backend.is_none() {
                    return Err(Error::new(ErrorDetails::Config {
                        message: "Quota counters are configured to use Redis, but Redis is not available. Please check the environment variable `QUOTA_REDIS_URL` is set and reachable.".to_string(),
                    }));
                }
                redis_backend
            }
            CounterBackendMode::Durable => {
                if !postgres_available {
                    return Err(Error::new(ErrorDetails::Config {
                        message: "Quota counters are configured to use the durable usage log, but Postgres is not available. Please check the environment variable `QUOTA_POSTGRES_URL` is set.".to_string(),
                    }));
                }
                None
            }
            CounterBackendMode::InMemory => {
                Some(Arc::new(InMemoryCounterBackend::new()) as Arc<dyn CounterBackend>)
            }
            CounterBackendMode::Auto => match redis_backend {
                Some(redis) => Some(redis),
                None if postgres_available => None,
                None => {
                    tracing::warn!("Neither Redis nor Postgres is available; quota counters are process-local and reset on restart");
                    Some(Arc::new(InMemoryCounterBackend::new()) as Arc<dyn CounterBackend>)
                }
            },
        };

        let backends = Self::new(fast, durable, metrics);
        tracing::info!("Using `{}` for quota counters", backends.active_kind());
        Ok(backends)
    }

    /// The backend that serves reads while everything is healthy.
    pub fn active_kind(&self) -> CounterBackendKind {
        match &self.fast {
            Some(fast) => fast.kind(),
            None => self.durable.kind(),
        }
    }

    /// Reads from the fast backend, re-issuing the read against the durable log
    /// when the fast backend reports an infrastructure failure.
    pub async fn read(&self, key: &CounterKey<'_>, now: DateTime<Utc>) -> Result<WindowUsage, Error> {
        let Some(fast) = &self.fast else {
            return self.durable.read(key, now).await;
        };
        match fast.read(key, now).await {
            Ok(usage) => Ok(usage),
            Err(e) if e.is_backend_failure() => {
                tracing::warn!(
                    quota.fallback = true,
                    backend = fast.kind().as_ref(),
                    window = key.window.as_ref(),
                    "Fast counter backend failed, reading from the durable usage log instead: {e}"
                );
                self.metrics.record_fast_fallback();
                self.durable.read(key, now).await
            }
            Err(e) => Err(e),
        }
    }

    /// Increments the fast counter if there is one. The durable log is advanced by
    /// appending usage records, so there is nothing to do without a fast backend.
    pub async fn increment_fast(
        &self,
        key: &CounterKey<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<WindowUsage>, Error> {
        match &self.fast {
            Some(fast) => fast.increment(key, now).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn health(&self) -> Result<(), Error> {
        if let Some(fast) = &self.fast {
            fast.health().await?;
        }
        self.durable.health().await
    }
}
