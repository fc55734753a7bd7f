use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use super::scripts::ScriptStore;
use crate::error::StoreError;

/// Redis-backed script store. Calls past `max_in_flight` wait on a permit; the runtime's
/// timeout bounds that wait.
pub struct RedisScriptStore {
    client: redis::Client,
    prefix: String,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    permits: Semaphore,
}

impl std::fmt::Debug for RedisScriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisScriptStore")
            .field("prefix", &self.prefix)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl RedisScriptStore {
    pub fn new(url: impl AsRef<str>, max_in_flight: usize) -> Result<Self, StoreError> {
        let client = redis::Client::open(url.as_ref()).map_err(map_redis_error)?;
        Ok(Self {
            client,
            prefix: String::new(),
            conn: Mutex::new(None),
            permits: Semaphore::new(max_in_flight.max(1)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefixed(&self, keys: &[String]) -> Vec<String> {
        if self.prefix.is_empty() {
            return keys.to_vec();
        }
        keys.iter()
            .map(|key| format!("{}:{key}", self.prefix))
            .collect()
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.conn.lock().await = None;
    }

    async fn query(&self, cmd: redis::Cmd) -> Result<redis::Value, StoreError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("store closed".to_string()))?;
        let mut conn = self.connection().await?;
        match cmd.query_async::<redis::Value>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
                    debug!(error = %err, "dropping redis connection");
                    self.reset_connection().await;
                }
                Err(map_redis_error(err))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.query(redis::cmd("PING")).await.map(|_| ())
    }
}

#[async_trait]
impl ScriptStore for RedisScriptStore {
    async fn load_script(&self, source: &str) -> Result<String, StoreError> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(source);
        match self.query(cmd).await? {
            redis::Value::BulkString(raw) => String::from_utf8(raw)
                .map_err(|err| StoreError::Response(format!("script sha not utf-8: {err}"))),
            redis::Value::SimpleString(sha) => Ok(sha),
            other => Err(StoreError::Response(format!(
                "unexpected SCRIPT LOAD reply: {other:?}"
            ))),
        }
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len()).arg(self.prefixed(keys)).arg(args);
        reply_to_i64(self.query(cmd).await?)
    }

    async fn eval(&self, source: &str, keys: &[String], args: &[String]) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(source)
            .arg(keys.len())
            .arg(self.prefixed(keys))
            .arg(args);
        reply_to_i64(self.query(cmd).await?)
    }
}

fn reply_to_i64(value: redis::Value) -> Result<i64, StoreError> {
    match value {
        redis::Value::Int(code) => Ok(code),
        redis::Value::Nil => Ok(0),
        other => Err(StoreError::Response(format!(
            "unexpected script reply: {other:?}"
        ))),
    }
}

fn map_redis_error(err: redis::RedisError) -> StoreError {
    if err.kind() == redis::ErrorKind::NoScriptError {
        return StoreError::NoScript;
    }
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        return StoreError::Connection(err.to_string());
    }
    if err.is_timeout() {
        return StoreError::Connection(format!("redis timeout: {err}"));
    }
    StoreError::Response(format!("redis error: {err}"))
}
