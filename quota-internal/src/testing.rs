#![cfg(test)]

use std::sync::Arc;

use crate::config_parser::{Config, QuotaConfig};
use crate::counter::{CounterBackend, CounterBackends, DurableCounterBackend, InMemoryCounterBackend};
use crate::db::mock::MockDatabase;
use crate::db::postgres::PostgresConnectionInfo;
use crate::gateway_util::AppStateData;
use crate::observability::QuotaMetrics;
use crate::redis_client::RedisConnectionInfo;
use crate::service::QuotaService;
use crate::types::LimitPolicy;

/// A service over the mock database, with handles to flip store health from a test.
pub struct UnitTestQuota {
    pub service: QuotaService,
    pub db: Arc<MockDatabase>,
    pub fast: Option<Arc<InMemoryCounterBackend>>,
}

pub async fn get_unit_test_quota(with_fast: bool) -> UnitTestQuota {
    get_unit_test_quota_with_config(with_fast, &QuotaConfig::default()).await
}

pub async fn get_unit_test_quota_with_config(
    with_fast: bool,
    config: &QuotaConfig,
) -> UnitTestQuota {
    let db = Arc::new(MockDatabase::with_policies(LimitPolicy::builtin_defaults()).await);
    let fast = with_fast.then(|| Arc::new(InMemoryCounterBackend::new()));
    let metrics = Arc::new(QuotaMetrics::default());
    let counters = CounterBackends::new(
        fast.clone().map(|f| f as Arc<dyn CounterBackend>),
        Arc::new(DurableCounterBackend::new(db.clone())),
        metrics.clone(),
    );
    let service = QuotaService::new(db.clone(), db.clone(), counters, config, metrics);
    UnitTestQuota { service, db, fast }
}

pub async fn get_unit_test_app_state_data(postgres_healthy: bool) -> AppStateData {
    let config = Arc::new(Config::default());
    let quota = get_unit_test_quota(true).await;
    quota.db.set_healthy(postgres_healthy);
    AppStateData {
        config,
        quota: quota.service,
        postgres_connection_info: PostgresConnectionInfo::Mock(quota.db),
        redis_connection_info: RedisConnectionInfo::Disabled,
    }
}
