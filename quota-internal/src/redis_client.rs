use std::time::Duration;

use redis::aio::MultiplexedConnection;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, ErrorDetails};

#[derive(Clone)]
pub enum RedisConnectionInfo {
    Enabled { connection: MultiplexedConnection },
    Disabled,
}

impl std::fmt::Debug for RedisConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enabled { .. } => f.write_str("RedisConnectionInfo::Enabled"),
            Self::Disabled => f.write_str("RedisConnectionInfo::Disabled"),
        }
    }
}

impl RedisConnectionInfo {
    /// Connects and pings Redis, giving up after `probe_timeout`.
    pub async fn connect(url: &SecretString, probe_timeout: Duration) -> Result<Self, Error> {
        match tokio::time::timeout(probe_timeout, Self::init_conn(url)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::RedisConnection {
                message: format!(
                    "Timed out after {}ms while connecting",
                    probe_timeout.as_millis()
                ),
            })),
        }
    }

    /// Like `connect`, but an unreachable Redis leaves the process running without
    /// a fast backend instead of failing start-up.
    pub async fn probe(url: Option<&SecretString>, probe_timeout: Duration) -> Self {
        let Some(url) = url else {
            tracing::info!("`QUOTA_REDIS_URL` is not set, running without a fast counter backend");
            return Self::Disabled;
        };
        match Self::connect(url, probe_timeout).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Redis is unreachable at start, running without a fast counter backend: {e}");
                Self::Disabled
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    async fn init_conn(url: &SecretString) -> Result<Self, Error> {
        let client = redis::Client::open(url.expose_secret()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new_without_logging(ErrorDetails::RedisConnection {
                    message: e.to_string(),
                })
            })?;
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|e| {
                Error::new_without_logging(ErrorDetails::RedisConnection {
                    message: e.to_string(),
                })
            })?;
        Ok(Self::Enabled { connection })
    }
}
