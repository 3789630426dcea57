use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::counter::{CounterBackends, CounterKey};
use crate::db::UsageLogQueries;
use crate::observability::QuotaMetrics;
use crate::types::{Feature, UsageRecord, WindowKind};

/// Appends usage records and nudges the fast counters. Never fails the caller.
#[derive(Clone)]
pub struct UsageRecorder {
    usage_log: Arc<dyn UsageLogQueries>,
    counters: CounterBackends,
    record_timeout: Duration,
    metrics: Arc<QuotaMetrics>,
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder")
            .field("counters", &self.counters)
            .field("record_timeout", &self.record_timeout)
            .finish()
    }
}

impl UsageRecorder {
    pub fn new(
        usage_log: Arc<dyn UsageLogQueries>,
        counters: CounterBackends,
        record_timeout: Duration,
        metrics: Arc<QuotaMetrics>,
    ) -> Self {
        Self {
            usage_log,
            counters,
            record_timeout,
            metrics,
        }
    }

    pub async fn record(
        &self,
        user_id: &str,
        feature: Feature,
        success: bool,
        metadata: Option<Value>,
    ) {
        self.record_at(user_id, feature, success, metadata, Utc::now())
            .await;
    }

    /// The write runs on its own task, so dropping this future does not cancel it.
    pub async fn record_at(
        &self,
        user_id: &str,
        feature: Feature,
        success: bool,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) {
        let recorder = self.clone();
        let record = UsageRecord::new(user_id.to_string(), feature, now, success, metadata);
        let task = tokio::spawn(async move { recorder.write(record).await });
        if let Err(e) = task.await {
            warn!(
                quota.record_failure = true,
                stage = "task",
                "Usage recording task did not complete: {e}"
            );
            self.metrics.record_record_failure("task");
        }
    }

    async fn write(&self, record: UsageRecord) {
        let feature = record.feature.as_ref();
        match timeout(self.record_timeout, self.usage_log.insert_usage_record(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    quota.record_failure = true,
                    stage = "append",
                    feature,
                    "Failed to append usage record: {e}"
                );
                self.metrics.record_record_failure("append");
            }
            Err(_) => {
                warn!(
                    quota.record_failure = true,
                    stage = "append",
                    feature,
                    "Appending usage record timed out after {}ms",
                    self.record_timeout.as_millis()
                );
                self.metrics.record_record_failure("append");
            }
        }

        // Failed calls never count toward the quota.
        if !record.success {
            return;
        }

        // Both windows go out together, so a record costs at most two round-trips.
        tokio::join!(
            self.increment_window(&record, WindowKind::Hourly),
            self.increment_window(&record, WindowKind::Daily),
        );
    }

    async fn increment_window(&self, record: &UsageRecord, window: WindowKind) {
        let feature = record.feature.as_ref();
        let key = CounterKey::new(&record.user_id, record.feature, window);
        match timeout(self.record_timeout, self.counters.increment_fast(&key, record.used_at)).await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(
                    stage = "increment",
                    feature,
                    window = window.as_ref(),
                    "Skipping fast counter increment: {e}"
                );
                self.metrics.record_record_failure("increment");
            }
            Err(_) => {
                debug!(
                    stage = "increment",
                    feature,
                    window = window.as_ref(),
                    "Fast counter increment timed out"
                );
                self.metrics.record_record_failure("increment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{
        CounterBackend, CounterBackendKind, DurableCounterBackend, InMemoryCounterBackend,
        WindowUsage,
    };
    use crate::db::mock::MockDatabase;
    use crate::db::UsageCount;
    use crate::error::Error;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strum::IntoEnumIterator;
    use tracing_test::traced_test;

    fn now() -> DateTime<Utc> {
        "2024-02-01T09:00:00Z".parse().unwrap()
    }

    fn recorder_with(
        usage_log: Arc<dyn UsageLogQueries>,
        fast: Option<Arc<InMemoryCounterBackend>>,
        metrics: Arc<QuotaMetrics>,
    ) -> UsageRecorder {
        let counters = CounterBackends::new(
            fast.map(|f| f as Arc<dyn CounterBackend>),
            Arc::new(DurableCounterBackend::new(usage_log.clone())),
            metrics.clone(),
        );
        UsageRecorder::new(usage_log, counters, Duration::from_millis(300), metrics)
    }

    #[tokio::test]
    async fn test_success_appends_and_increments_both_windows() {
        let db = Arc::new(MockDatabase::default());
        let fast = Arc::new(InMemoryCounterBackend::new());
        let recorder = recorder_with(
            db.clone(),
            Some(fast.clone()),
            Arc::new(QuotaMetrics::default()),
        );

        recorder
            .record_at(
                "user-1",
                Feature::CoverLetter,
                true,
                Some(json!({"model": "gpt-4o-mini"})),
                now(),
            )
            .await;

        let records = db.usage_records().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].metadata, Some(json!({"model": "gpt-4o-mini"})));
        for window in WindowKind::iter() {
            let usage = fast
                .read(&CounterKey::new("user-1", Feature::CoverLetter, window), now())
                .await
                .unwrap();
            assert_eq!(usage.count, 1);
        }
    }

    #[tokio::test]
    async fn test_failed_call_is_logged_but_never_counted() {
        let db = Arc::new(MockDatabase::default());
        let fast = Arc::new(InMemoryCounterBackend::new());
        let recorder = recorder_with(
            db.clone(),
            Some(fast.clone()),
            Arc::new(QuotaMetrics::default()),
        );

        recorder
            .record_at("user-1", Feature::JobFitAnalysis, false, None, now())
            .await;

        assert_eq!(db.usage_records().await.len(), 1);
        assert!(fast.is_empty());
        let durable = DurableCounterBackend::new(db.clone());
        let usage = durable
            .read(
                &CounterKey::new("user-1", Feature::JobFitAnalysis, WindowKind::Daily),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(usage.count, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failures_are_swallowed() {
        let db = Arc::new(MockDatabase::new(false));
        let fast = Arc::new(InMemoryCounterBackend::new());
        fast.set_healthy(false);
        let metrics = Arc::new(QuotaMetrics::default());
        let recorder = recorder_with(db.clone(), Some(fast), metrics.clone());

        recorder
            .record_at("user-1", Feature::CareerAdvice, true, None, now())
            .await;

        assert_eq!(metrics.snapshot().record_failures, 3);
        assert!(logs_contain("Failed to append usage record"));
    }

    #[tokio::test]
    async fn test_without_fast_backend_only_appends() {
        let db = Arc::new(MockDatabase::default());
        let metrics = Arc::new(QuotaMetrics::default());
        let recorder = recorder_with(db.clone(), None, metrics.clone());
        recorder
            .record_at("user-1", Feature::InterviewPrep, true, None, now())
            .await;
        assert_eq!(db.usage_records().await.len(), 1);
        assert_eq!(metrics.snapshot().record_failures, 0);
    }

    struct SlowUsageLog {
        inner: MockDatabase,
        delay: Duration,
    }

    #[async_trait]
    impl UsageLogQueries for SlowUsageLog {
        async fn insert_usage_record(&self, record: &UsageRecord) -> Result<(), Error> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert_usage_record(record).await
        }

        async fn count_successful_usage(
            &self,
            user_id: &str,
            feature: Feature,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<UsageCount, Error> {
            self.inner
                .count_successful_usage(user_id, feature, since, until)
                .await
        }

        async fn health(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dropping_caller_does_not_cancel_write() {
        let slow = Arc::new(SlowUsageLog {
            inner: MockDatabase::default(),
            delay: Duration::from_millis(50),
        });
        let recorder = recorder_with(slow.clone(), None, Arc::new(QuotaMetrics::default()));

        let caller = tokio::time::timeout(
            Duration::from_millis(5),
            recorder.record_at("user-1", Feature::ResumeAnalysis, true, None, now()),
        )
        .await;
        assert!(caller.is_err(), "caller should have given up first");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slow.inner.usage_records().await.len(), 1);
    }

    /// Tracks how many increments are in flight at once.
    struct ConcurrencyTrackingCounter {
        inner: InMemoryCounterBackend,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl CounterBackend for ConcurrencyTrackingCounter {
        fn kind(&self) -> CounterBackendKind {
            self.inner.kind()
        }

        async fn increment(
            &self,
            key: &CounterKey<'_>,
            now: DateTime<Utc>,
        ) -> Result<WindowUsage, Error> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.increment(key, now).await
        }

        async fn read(
            &self,
            key: &CounterKey<'_>,
            now: DateTime<Utc>,
        ) -> Result<WindowUsage, Error> {
            self.inner.read(key, now).await
        }

        async fn health(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_window_increments_run_concurrently() {
        let db = Arc::new(MockDatabase::default());
        let fast = Arc::new(ConcurrencyTrackingCounter {
            inner: InMemoryCounterBackend::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let metrics = Arc::new(QuotaMetrics::default());
        let counters = CounterBackends::new(
            Some(fast.clone() as Arc<dyn CounterBackend>),
            Arc::new(DurableCounterBackend::new(db.clone())),
            metrics.clone(),
        );
        let recorder = UsageRecorder::new(db.clone(), counters, Duration::from_millis(300), metrics);

        recorder
            .record_at("user-1", Feature::CoverLetter, true, None, now())
            .await;

        assert_eq!(fast.max_in_flight.load(Ordering::SeqCst), 2);
        for window in WindowKind::iter() {
            let usage = fast
                .read(&CounterKey::new("user-1", Feature::CoverLetter, window), now())
                .await
                .unwrap();
            assert_eq!(usage.count, 1);
        }
    }
}
