use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;

use super::{CounterBackend, CounterBackendKind, CounterKey, WindowUsage};
use crate::error::{Error, ErrorDetails};

/// INCR the key and attach the window TTL if the key has none yet.
/// Returns `{count, pttl_ms}`.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

pub struct RedisCounterBackend {
    connection: MultiplexedConnection,
    increment_script: Script,
}

impl RedisCounterBackend {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            increment_script: Script::new(INCREMENT_SCRIPT),
        }
    }
}

fn redis_error(e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::RedisQuery {
        message: e.to_string(),
    })
}

fn resets_at(now: DateTime<Utc>, pttl_ms: i64) -> Option<DateTime<Utc>> {
    (pttl_ms > 0).then(|| now + TimeDelta::milliseconds(pttl_ms))
}

#[async_trait]
impl CounterBackend for RedisCounterBackend {
    fn kind(&self) -> CounterBackendKind {
        CounterBackendKind::Redis
    }

    async fn increment(
        &self,
        key: &CounterKey<'_>,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, Error> {
        let mut conn = self.connection.clone();
        let (count, pttl_ms): (i64, i64) = self
            .increment_script
            .key(key.storage_key())
            .arg(key.window.duration().num_milliseconds())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(WindowUsage {
            count: u64::try_from(count).unwrap_or(0),
            resets_at: resets_at(now, pttl_ms),
        })
    }

    async fn read(&self, key: &CounterKey<'_>, now: DateTime<Utc>) -> Result<WindowUsage, Error> {
        let mut conn = self.connection.clone();
        let storage_key = key.storage_key();
        let (count, pttl_ms): (Option<i64>, i64) = redis::pipe()
            .atomic()
            .get(&storage_key)
            .pttl(&storage_key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(match count {
            Some(count) => WindowUsage {
                count: u64::try_from(count).unwrap_or(0),
                resets_at: resets_at(now, pttl_ms),
            },
            None => WindowUsage::empty(),
        })
    }

    async fn health(&self) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::RedisConnection {
                    message: e.to_string(),
                })
            })?;
        Ok(())
    }
}
