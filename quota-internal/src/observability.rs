use std::sync::atomic::{AtomicU64, Ordering};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::DecisionOutcome;

const DEFAULT_LOG_FILTER: &str = "warn,quota_internal=info,gateway=info";

pub const QUOTA_CHECKS_TOTAL: &str = "quota_checks_total";
pub const QUOTA_FAIL_OPEN_TOTAL: &str = "quota_fail_open_total";
pub const QUOTA_FAST_BACKEND_FALLBACK_TOTAL: &str = "quota_fast_backend_fallback_total";
pub const QUOTA_RECORD_FAILURES_TOTAL: &str = "quota_record_failures_total";

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default filter.
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Invalid log filter: {e}"),
            })
        })?;

    let fmt_layer = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })
}

/// Installs the global Prometheus recorder. The returned handle renders `/metrics`.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;
    metrics::describe_counter!(QUOTA_CHECKS_TOTAL, "Quota checks by outcome");
    metrics::describe_counter!(
        QUOTA_FAIL_OPEN_TOTAL,
        "Quota checks allowed because a store could not answer"
    );
    metrics::describe_counter!(
        QUOTA_FAST_BACKEND_FALLBACK_TOTAL,
        "Counter reads re-issued against the durable usage log"
    );
    metrics::describe_counter!(
        QUOTA_RECORD_FAILURES_TOTAL,
        "Usage accounting writes that failed and were dropped"
    );
    Ok(handle)
}

/// Process-local counters mirroring the exported metrics, surfaced on `/status`.
#[derive(Debug, Default)]
pub struct QuotaMetrics {
    checks_allowed: AtomicU64,
    checks_denied: AtomicU64,
    checks_no_policy: AtomicU64,
    fail_opens: AtomicU64,
    fast_backend_fallbacks: AtomicU64,
    record_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaMetricsSnapshot {
    pub checks_allowed: u64,
    pub checks_denied: u64,
    pub checks_no_policy: u64,
    pub fail_opens: u64,
    pub fast_backend_fallbacks: u64,
    pub record_failures: u64,
}

impl QuotaMetrics {
    pub fn record_check(&self, outcome: DecisionOutcome) {
        let counter = match outcome {
            DecisionOutcome::Allowed => &self.checks_allowed,
            DecisionOutcome::DeniedHourly
            | DecisionOutcome::DeniedDaily
            | DecisionOutcome::FailClosed => &self.checks_denied,
            DecisionOutcome::DeniedNoPolicy => &self.checks_no_policy,
            DecisionOutcome::FailOpen => &self.fail_opens,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(QUOTA_CHECKS_TOTAL, "outcome" => outcome.as_str()).increment(1);
    }

    pub fn record_fail_open(&self, reason: &'static str) {
        metrics::counter!(QUOTA_FAIL_OPEN_TOTAL, "reason" => reason).increment(1);
    }

    pub fn record_fast_fallback(&self) {
        self.fast_backend_fallbacks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(QUOTA_FAST_BACKEND_FALLBACK_TOTAL).increment(1);
    }

    pub fn record_record_failure(&self, stage: &'static str) {
        self.record_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(QUOTA_RECORD_FAILURES_TOTAL, "stage" => stage).increment(1);
    }

    pub fn snapshot(&self) -> QuotaMetricsSnapshot {
        QuotaMetricsSnapshot {
            checks_allowed: self.checks_allowed.load(Ordering::Relaxed),
            checks_denied: self.checks_denied.load(Ordering::Relaxed),
            checks_no_policy: self.checks_no_policy.load(Ordering::Relaxed),
            fail_opens: self.fail_opens.load(Ordering::Relaxed),
            fast_backend_fallbacks: self.fast_backend_fallbacks.load(Ordering::Relaxed),
            record_failures: self.record_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_metrics_snapshot() {
        let metrics = QuotaMetrics::default();
        metrics.record_check(DecisionOutcome::Allowed);
        metrics.record_check(DecisionOutcome::Allowed);
        metrics.record_check(DecisionOutcome::DeniedHourly);
        metrics.record_check(DecisionOutcome::DeniedDaily);
        metrics.record_check(DecisionOutcome::DeniedNoPolicy);
        metrics.record_check(DecisionOutcome::FailOpen);
        metrics.record_fail_open("timeout");
        metrics.record_fast_fallback();
        metrics.record_record_failure("append");

        assert_eq!(
            metrics.snapshot(),
            QuotaMetricsSnapshot {
                checks_allowed: 2,
                checks_denied: 2,
                checks_no_policy: 1,
                fail_opens: 1,
                fast_backend_fallbacks: 1,
                record_failures: 1,
            }
        );
    }

    #[test]
    fn test_log_format_display() {
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
