use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{FromRequest, Json, Request};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::config_parser::Config;
use crate::counter::CounterBackends;
use crate::db::postgres::PostgresConnectionInfo;
use crate::db::static_policies::StaticLimitPolicies;
use crate::db::{LimitPolicyQueries, UsageLogQueries};
use crate::error::{Error, ErrorDetails};
use crate::observability::QuotaMetrics;
use crate::redis_client::RedisConnectionInfo;
use crate::service::QuotaService;

const REDIS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// State for the API
#[derive(Clone, Debug)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub quota: QuotaService,
    pub postgres_connection_info: PostgresConnectionInfo,
    pub redis_connection_info: RedisConnectionInfo,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let postgres_url = std::env::var("QUOTA_POSTGRES_URL")
            .ok()
            .map(SecretString::from);
        let redis_url = std::env::var("QUOTA_REDIS_URL")
            .ok()
            .map(SecretString::from);

        let postgres_connection_info = setup_postgres(postgres_url.as_ref()).await?;
        let redis_connection_info =
            RedisConnectionInfo::probe(redis_url.as_ref(), REDIS_PROBE_TIMEOUT).await;
        Self::new_with_connections(config, postgres_connection_info, redis_connection_info).await
    }

    pub async fn new_with_connections(
        config: Arc<Config>,
        postgres_connection_info: PostgresConnectionInfo,
        redis_connection_info: RedisConnectionInfo,
    ) -> Result<Self, Error> {
        let metrics = Arc::new(QuotaMetrics::default());
        let counters = CounterBackends::new_from_connections(
            config.quota.counter_backend,
            &redis_connection_info,
            &postgres_connection_info,
            metrics.clone(),
        )?;

        let usage_log: Arc<dyn UsageLogQueries> = Arc::new(postgres_connection_info.clone());
        let policy_queries: Arc<dyn LimitPolicyQueries> = if postgres_connection_info.is_enabled()
        {
            Arc::new(postgres_connection_info.clone())
        } else {
            tracing::info!("Postgres is disabled, serving quota policies from config");
            Arc::new(StaticLimitPolicies::new(config.quota.effective_policies()))
        };

        let quota = QuotaService::new(
            policy_queries,
            usage_log,
            counters,
            &config.quota,
            metrics,
        );

        if config.quota.seed_policies && postgres_connection_info.is_enabled() {
            let written = quota
                .policies()
                .seed(&config.quota.effective_policies())
                .await?;
            tracing::info!("Seeded {written} quota policies into `ai_feature_limits`");
        }

        Ok(Self {
            config,
            quota,
            postgres_connection_info,
            redis_connection_info,
        })
    }
}

/// Connects to Postgres and brings the quota tables up to date. Without a URL the
/// usage log is disabled and policies come from config.
pub async fn setup_postgres(
    postgres_url: Option<&SecretString>,
) -> Result<PostgresConnectionInfo, Error> {
    let Some(postgres_url) = postgres_url else {
        tracing::warn!("Disabling the durable usage log: `QUOTA_POSTGRES_URL` is not set.");
        return Ok(PostgresConnectionInfo::new_disabled());
    };
    let postgres_connection_info = PostgresConnectionInfo::new_with_url(postgres_url).await?;
    postgres_connection_info.run_migrations().await?;
    Ok(postgres_connection_info)
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        // Report the path of the offending field, e.g. `tier: unknown variant`.
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
