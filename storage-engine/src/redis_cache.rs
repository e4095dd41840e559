use async_trait::async_trait;
use cache_core::domain::effective_batch_size;
use cache_core::{BackendKind, Cache, KeySpace, Value, codec, wildcard};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime, Status};
use redis::RedisError;
use shared::config::RemoteConfig;
use shared::{Error, Result};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// `COUNT` hint sent with every `SCAN`.
const SCAN_COUNT: usize = 1000;
/// Keys per `DEL` command inside a bulk deletion.
const DELETE_CHUNK_SIZE: usize = 1000;

/// Cache backed by a remote Redis server through a connection pool.
///
/// Every operation borrows one connection for its duration.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    keys: KeySpace,
}

impl RedisCache {
    /// Build the pool. No connection is opened until the first operation.
    pub fn connect(prefix: impl Into<String>, config: &RemoteConfig) -> Result<Self> {
        let keys = KeySpace::new(prefix)?;

        let mut pool_config = PoolConfig::new(config.pool_max_size);
        pool_config.timeouts.wait = Some(config.pool_wait_timeout);
        pool_config.timeouts.create = Some(config.pool_wait_timeout);

        let mut redis_config = Config::from_url(config.url());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                Error::BackendUnavailable(format!(
                    "failed to create redis pool for {}: {}",
                    config.host, e
                ))
            })?;

        info!(
            prefix = keys.prefix(),
            host = %config.host,
            max_size = config.pool_max_size,
            "created remote cache pool"
        );
        Ok(Self { pool, keys })
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keys
    }

    /// Round trip to the server on a pooled connection.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn("ping").await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("ping", self.keys.prefix(), e))?;
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.pool.status()
    }

    async fn conn(&self, op: &str) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            Error::BackendUnavailable(format!("{}: no connection available: {}", op, e))
        })
    }

    /// `SCAN` every key matching `glob`, stopping once `limit` keys are found.
    async fn scan(
        &self,
        conn: &mut Connection,
        op: &str,
        glob: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(glob)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await
                .map_err(|e| redis_error(op, glob, e))?;

            // SCAN may hand back a key more than once
            for key in batch {
                if found.len() >= limit {
                    return Ok(found);
                }
                if seen.insert(key.clone()) {
                    found.push(key);
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        found.truncate(limit);
        Ok(found)
    }

    /// Whether each of `keys` currently exists, one flag per key in argument order.
    async fn existing(
        &self,
        conn: &mut Connection,
        op: &str,
        keys: &[String],
    ) -> Result<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("EXISTS").arg(key);
        }
        let counts: Vec<i64> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| redis_error(op, self.keys.prefix(), e))?;
        Ok(counts.into_iter().map(|count| count > 0).collect())
    }

    async fn collect_keys(&self, limit: usize, pattern_or_keys: &[&str]) -> Result<Vec<String>> {
        let mut conn = self.conn("keys").await?;

        match pattern_or_keys {
            [] => {
                let glob = self.keys.glob("*");
                self.scan(&mut conn, "keys", &glob, limit).await
            }
            [pattern] if wildcard::is_pattern(pattern) => {
                let glob = self.keys.glob(pattern);
                if limit == usize::MAX {
                    redis::cmd("KEYS")
                        .arg(&glob)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| redis_error("keys", &glob, e))
                } else {
                    self.scan(&mut conn, "keys", &glob, limit).await
                }
            }
            exact => {
                let namespaced: Vec<String> = exact.iter().map(|key| self.keys.key(key)).collect();
                let present = self.existing(&mut conn, "keys", &namespaced).await?;
                Ok(namespaced
                    .into_iter()
                    .zip(present)
                    .filter_map(|(key, present)| present.then_some(key))
                    .take(limit)
                    .collect())
            }
        }
    }

    /// Collect every key matching `glob`, then delete them in one
    /// `MULTI/EXEC` group.
    async fn delete_matching(&self, op: &str, glob: &str) -> Result<usize> {
        let mut conn = self.conn(op).await?;
        let keys = self.scan(&mut conn, op, glob, usize::MAX).await?;
        if keys.is_empty() {
            debug!("{}: nothing matched {}", op, glob);
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for chunk in keys.chunks(DELETE_CHUNK_SIZE) {
            pipe.cmd("DEL").arg(chunk).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(op, glob, e))?;

        debug!("{}: deleted {} keys matching {}", op, keys.len(), glob);
        Ok(keys.len())
    }

    async fn write(
        &self,
        op: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
        only_existing: bool,
    ) -> Result<bool> {
        let namespaced = self.keys.key(key);
        let payload = codec::encode_entry(&namespaced, value)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&namespaced).arg(payload);
        if only_existing {
            cmd.arg("XX");
        }
        if let Some(ms) = ttl_millis(ttl) {
            cmd.arg("PX").arg(ms);
        }

        let mut conn = self.conn(op).await?;
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(op, &namespaced, e))?;
        Ok(reply.is_some())
    }

    fn bulk_set(&self, entries: &[(String, Value)], ttl: Option<Duration>) -> Result<redis::Pipeline> {
        let ms = ttl_millis(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let namespaced = self.keys.key(key);
            let payload = codec::encode_entry(&namespaced, value)?;
            let cmd = pipe.cmd("SET").arg(&namespaced).arg(payload);
            if let Some(ms) = ms {
                cmd.arg("PX").arg(ms);
            }
            cmd.ignore();
        }
        Ok(pipe)
    }
}

/// Milliseconds for `SET .. PX`; `None` when the entry should not expire.
fn ttl_millis(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
        .filter(|ms| *ms > 0)
}

/// Interpret a `PTTL` reply: `-2` absent, `-1` no expiry.
fn ttl_from_reply(namespaced: &str, pttl: i64) -> Result<Duration> {
    match pttl {
        -2 => Err(Error::NotFound(namespaced.to_string())),
        ms if ms < 0 => Ok(Duration::ZERO),
        ms => Ok(Duration::from_millis(ms.unsigned_abs())),
    }
}

fn redis_error(op: &str, key: &str, err: RedisError) -> Error {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        Error::BackendUnavailable(format!("{} {}: {}", op, key, err))
    } else {
        Error::Internal(format!("{} {}: {}", op, key, err))
    }
}

#[async_trait]
impl Cache for RedisCache {
    fn prefix(&self) -> &str {
        self.keys.prefix()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let namespaced = self.keys.key(key);
        let mut conn = self.conn("exists").await?;
        let count: i64 = redis::cmd("EXISTS")
            .arg(&namespaced)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("exists", &namespaced, e))?;
        Ok(count > 0)
    }

    async fn get(&self, key: &str) -> Result<Value> {
        let namespaced = self.keys.key(key);
        let mut conn = self.conn("get").await?;
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&namespaced)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("get", &namespaced, e))?;

        match raw {
            Some(raw) => codec::decode_entry(&namespaced, &raw),
            None => Err(Error::NotFound(namespaced)),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.write("set", key, &value, ttl, false).await?;
        Ok(())
    }

    async fn update(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        if self.write("update", key, &value, ttl, true).await? {
            Ok(())
        } else {
            Err(Error::KeyDoesNotExist(self.keys.key(key)))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let namespaced = self.keys.key(key);
        let mut conn = self.conn("delete").await?;
        let _: i64 = redis::cmd("DEL")
            .arg(&namespaced)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("delete", &namespaced, e))?;
        Ok(())
    }

    async fn keys(&self, pattern_or_keys: &[&str]) -> Result<Vec<String>> {
        self.collect_keys(usize::MAX, pattern_or_keys).await
    }

    async fn keys_with_batch_size(
        &self,
        batch_size: usize,
        pattern_or_keys: &[&str],
    ) -> Result<Vec<String>> {
        self.collect_keys(effective_batch_size(batch_size), pattern_or_keys)
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let namespaced = self.keys.key(key);
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut conn = self.conn("expire").await?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(&namespaced)
            .arg(ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("expire", &namespaced, e))?;

        if applied == 0 {
            return Err(Error::NotFound(namespaced));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Duration> {
        let namespaced = self.keys.key(key);
        let mut conn = self.conn("ttl").await?;
        let pttl: i64 = redis::cmd("PTTL")
            .arg(&namespaced)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("ttl", &namespaced, e))?;
        ttl_from_reply(&namespaced, pttl)
    }

    async fn empty_by_match(&self, pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            return Err(Error::InvalidArgument(
                "empty_by_match requires a non-empty pattern".to_string(),
            ));
        }
        self.delete_matching("empty_by_match", &self.keys.glob(pattern))
            .await?;
        Ok(())
    }

    async fn empty(&self) -> Result<()> {
        self.delete_matching("empty", &self.keys.glob("*")).await?;
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let pipe = self.bulk_set(&entries, ttl)?;
        let mut conn = self.conn("set_many").await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("set_many", self.keys.prefix(), e))?;
        debug!("set_many wrote {} entries", entries.len());
        Ok(())
    }

    async fn update_many(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let namespaced: Vec<String> = entries.iter().map(|(key, _)| self.keys.key(key)).collect();
        let pipe = self.bulk_set(&entries, ttl)?;

        let mut conn = self.conn("update_many").await?;
        let present = self.existing(&mut conn, "update_many", &namespaced).await?;
        if let Some((key, _)) = namespaced
            .iter()
            .zip(&present)
            .find(|(_, present)| !**present)
        {
            return Err(Error::KeyDoesNotExist(key.clone()));
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("update_many", self.keys.prefix(), e))?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let namespaced: Vec<String> = keys.iter().map(|key| self.keys.key(key)).collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for chunk in namespaced.chunks(DELETE_CHUNK_SIZE) {
            pipe.cmd("DEL").arg(chunk).ignore();
        }

        let mut conn = self.conn("delete_many").await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("delete_many", self.keys.prefix(), e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        info!(prefix = self.keys.prefix(), "closed remote cache pool");
        Ok(())
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("prefix", &self.keys.prefix())
            .field("status", &self.pool.status())
            .finish()
    }
}
