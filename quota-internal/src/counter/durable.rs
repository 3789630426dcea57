use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CounterBackend, CounterBackendKind, CounterKey, WindowUsage};
use crate::db::UsageLogQueries;
use crate::error::Error;

/// Counts successful rows of the usage log inside the rolling window.
///
/// `increment` writes nothing: appending the usage record is what advances this
/// counter, so it only reports the current count.
pub struct DurableCounterBackend {
    usage_log: Arc<dyn UsageLogQueries>,
}

impl DurableCounterBackend {
    pub fn new(usage_log: Arc<dyn UsageLogQueries>) -> Self {
        Self { usage_log }
    }
}

#[async_trait]
impl CounterBackend for DurableCounterBackend {
    fn kind(&self) -> CounterBackendKind {
        CounterBackendKind::Durable
    }

    async fn increment(
        &self,
        key: &CounterKey<'_>,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, Error> {
        self.read(key, now).await
    }

    async fn read(&self, key: &CounterKey<'_>, now: DateTime<Utc>) -> Result<WindowUsage, Error> {
        let usage = self
            .usage_log
            .count_successful_usage(
                key.user_id,
                key.feature,
                key.window.window_start(now),
                now,
            )
            .await?;
        // The window frees up once the oldest counted call falls out of it.
        Ok(WindowUsage {
            count: usage.count,
            resets_at: usage.oldest.map(|oldest| oldest + key.window.duration()),
        })
    }

    async fn health(&self) -> Result<(), Error> {
        self.usage_log.health().await
    }
}
