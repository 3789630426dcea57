use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::types::LimitPolicy;

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Defaults to `0.0.0.0:3000` when absent
    pub bind_address: Option<SocketAddr>,
    /// Include internal error details in HTTP responses
    #[serde(default)]
    pub debug: bool,
}

/// Which counter backend serves live enforcement.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterBackendMode {
    /// Redis when it answers at start, otherwise the durable log
    #[default]
    Auto,
    /// Redis is required; start fails if it cannot be reached
    Fast,
    /// Count straight from the usage log
    Durable,
    /// Process-local counters, for single-instance deployments
    InMemory,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(default)]
    pub counter_backend: CounterBackendMode,

    /// Upper bound on a whole `check`, after which the request fails open
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    /// Upper bound on each write performed by `record`
    #[serde(default = "default_record_timeout_ms")]
    pub record_timeout_ms: u64,

    /// Allow requests when the stores cannot answer
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    /// Limit and remaining reported on a fail-open decision
    #[serde(default = "default_fail_open_placeholder_limit")]
    pub fail_open_placeholder_limit: u32,

    /// Write configured policies into `ai_feature_limits` at start, keeping existing rows
    #[serde(default = "default_seed_policies")]
    pub seed_policies: bool,

    #[serde(default)]
    pub policies: Vec<LimitPolicy>,
}

fn default_check_timeout_ms() -> u64 {
    300
}

fn default_record_timeout_ms() -> u64 {
    300
}

fn default_fail_open() -> bool {
    true
}

fn default_fail_open_placeholder_limit() -> u32 {
    1000
}

fn default_seed_policies() -> bool {
    true
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            counter_backend: CounterBackendMode::default(),
            check_timeout_ms: default_check_timeout_ms(),
            record_timeout_ms: default_record_timeout_ms(),
            fail_open: default_fail_open(),
            fail_open_placeholder_limit: default_fail_open_placeholder_limit(),
            seed_policies: default_seed_policies(),
            policies: Vec::new(),
        }
    }
}

impl QuotaConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }

    /// The configured catalogue, or the built-in one when none is configured.
    pub fn effective_policies(&self) -> Vec<LimitPolicy> {
        if self.policies.is_empty() {
            LimitPolicy::builtin_defaults()
        } else {
            self.policies.clone()
        }
    }
}

impl Config {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::parse_toml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_toml(contents: &str) -> Result<Config, Error> {
        let deserializer = toml::de::Deserializer::new(contents);
        serde_path_to_error::deserialize(deserializer).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config at `{}`: {}", e.path(), e.inner()),
            })
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for policy in &self.quota.policies {
            if !seen.insert((policy.tier, policy.feature)) {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "Duplicate quota policy for tier `{}` and feature `{}`",
                        policy.tier, policy.feature
                    ),
                }));
            }
            if policy.hourly_limit > policy.daily_limit {
                tracing::warn!(
                    "Quota policy for tier `{}` and feature `{}` has hourly_limit {} above daily_limit {}; the daily limit will bind first",
                    policy.tier,
                    policy.feature,
                    policy.hourly_limit,
                    policy.daily_limit
                );
            }
        }
        if self.quota.check_timeout_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`quota.check_timeout_ms` must be greater than zero".to_string(),
            }));
        }
        if self.quota.record_timeout_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`quota.record_timeout_ms` must be greater than zero".to_string(),
            }));
        }
        Ok(())
    }
}
