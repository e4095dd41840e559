use crate::record::{self, Record};
use crate::snapshot;
use async_trait::async_trait;
use cache_core::domain::effective_batch_size;
use cache_core::{BackendKind, Cache, KeySpace, StoreSize, Value, codec, wildcard};
use shared::config::EmbeddedConfig;
use shared::{Error, Result};
use sled::IVec;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keys deleted per transaction by `empty` and `empty_by_match`.
const DELETE_BATCH_SIZE: usize = 10_000;
/// Retries of a conflicting deletion round before giving up.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Cache backed by an embedded sled store.
///
/// Records carry their own expiry header (see [`crate::record`]); expired
/// records are invisible to every read path and are physically removed by
/// bulk deletion or [`SledCache::run_gc`].
#[derive(Clone)]
pub struct SledCache {
    db: sled::Db,
    keys: KeySpace,
}

impl SledCache {
    /// Open (or create) the store described by `config`.
    /// Creates the data directory if it doesn't exist
    pub fn open(prefix: impl Into<String>, config: &EmbeddedConfig) -> Result<Self> {
        let keys = KeySpace::new(prefix)?;

        let mut builder = sled::Config::new()
            .cache_capacity(config.cache_capacity_bytes)
            .flush_every_ms(config.flush_every_ms);

        if config.temporary {
            builder = builder.temporary(true);
        } else {
            std::fs::create_dir_all(&config.path).map_err(|e| {
                Error::BackendUnavailable(format!(
                    "failed to create directory {}: {}",
                    config.path.display(),
                    e
                ))
            })?;
            builder = builder.path(&config.path);
        }

        let db = builder.open().map_err(|e| {
            Error::BackendUnavailable(format!(
                "failed to open sled database at {}: {}",
                config.path.display(),
                e
            ))
        })?;

        info!(prefix = keys.prefix(), "opened embedded cache store");
        Ok(Self { db, keys })
    }

    /// Wrap an already open store; several prefixes may share one store.
    pub fn with_db(prefix: impl Into<String>, db: sled::Db) -> Result<Self> {
        Ok(Self {
            db,
            keys: KeySpace::new(prefix)?,
        })
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keys
    }

    /// Write a binary snapshot of the whole store, every prefix included.
    /// Returns the number of records written.
    pub fn backup<W: Write>(&self, writer: W) -> Result<u64> {
        let written = snapshot::write_snapshot(&self.db, writer)?;
        info!("backup wrote {} records", written);
        Ok(written)
    }

    /// Load a snapshot produced by [`SledCache::backup`].
    pub fn restore<R: Read>(&self, reader: R) -> Result<u64> {
        let loaded = snapshot::read_snapshot(&self.db, reader)?;
        info!("restore loaded {} records", loaded);
        Ok(loaded)
    }

    /// Physically remove expired records of every prefix, then flush.
    /// Returns the number of records purged.
    pub fn run_gc(&self) -> Result<usize> {
        let now = record::now_ms();
        let mut purged = 0;

        for item in self.db.iter() {
            let (key, value) = item.map_err(|e| storage_error("run_gc", "*", e))?;
            let name = String::from_utf8_lossy(&key);
            if record::is_live(&name, &value, now) {
                continue;
            }
            // a concurrent rewrite wins over the purge
            let swapped = self
                .db
                .compare_and_swap(&key, Some(&value), None::<IVec>)
                .map_err(|e| storage_error("run_gc", &name, e))?;
            if swapped.is_ok() {
                purged += 1;
            }
        }

        self.sync()?;
        debug!("gc purged {} expired records", purged);
        Ok(purged)
    }

    /// Force a flush of dirty buffers to disk; returns the bytes flushed.
    pub fn sync(&self) -> Result<usize> {
        self.db.flush().map_err(|e| storage_error("sync", "*", e))
    }

    pub fn size(&self) -> Result<StoreSize> {
        let disk_bytes = self
            .db
            .size_on_disk()
            .map_err(|e| storage_error("size", "*", e))?;
        Ok(StoreSize {
            disk_bytes,
            entries: self.db.len(),
        })
    }

    /// Drop every record of the store, regardless of prefix.
    pub fn clear(&self) -> Result<()> {
        self.db.clear().map_err(|e| storage_error("clear", "*", e))?;
        info!("cleared embedded store");
        Ok(())
    }

    /// Remove everything under this instance's prefix in one atomic batch.
    pub fn drop_prefix(&self) -> Result<usize> {
        let namespace = self.keys.namespace();
        let mut batch = sled::Batch::default();
        let mut dropped = 0;

        for item in self.db.scan_prefix(namespace.as_bytes()) {
            let (key, _) = item.map_err(|e| storage_error("drop_prefix", &namespace, e))?;
            batch.remove(key);
            dropped += 1;
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| storage_error("drop_prefix", &namespace, e))?;
        Ok(dropped)
    }

    /// Raw record for a namespaced key, if present and not expired.
    fn read_live(&self, op: &str, namespaced: &str, now: u64) -> Result<Option<IVec>> {
        let raw = self
            .db
            .get(namespaced.as_bytes())
            .map_err(|e| storage_error(op, namespaced, e))?;
        Ok(raw.filter(|raw| record::is_live(namespaced, raw, now)))
    }

    /// Records under the namespace whose logical name matches `pattern`
    /// (every record when `None`), at most `limit` of them. Expired records
    /// are skipped when `live_at` is given.
    fn matching_records(
        &self,
        op: &str,
        pattern: Option<&str>,
        limit: usize,
        live_at: Option<u64>,
    ) -> Result<Vec<(IVec, IVec)>> {
        let seek = match pattern {
            Some(pattern) => self.keys.seek_prefix(pattern),
            None => self.keys.namespace(),
        };

        let mut found = Vec::new();
        for item in self.db.scan_prefix(seek.as_bytes()) {
            if found.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| storage_error(op, &seek, e))?;
            let Ok(name) = std::str::from_utf8(&key) else {
                continue;
            };
            if let Some(pattern) = pattern {
                match self.keys.logical(name) {
                    Some(logical) if wildcard::matches(logical, pattern) => {}
                    _ => continue,
                }
            }
            if live_at.is_some_and(|now| !record::is_live(name, &value, now)) {
                continue;
            }
            found.push((key, value));
        }
        Ok(found)
    }

    fn collect_keys(&self, limit: usize, pattern_or_keys: &[&str]) -> Result<Vec<String>> {
        let now = record::now_ms();
        let records = match pattern_or_keys {
            [] => self.matching_records("keys", None, limit, Some(now))?,
            [pattern] if wildcard::is_pattern(pattern) => {
                self.matching_records("keys", Some(pattern), limit, Some(now))?
            }
            exact => {
                let mut found = Vec::new();
                for key in exact {
                    if found.len() >= limit {
                        break;
                    }
                    let namespaced = self.keys.key(key);
                    if self.read_live("keys", &namespaced, now)?.is_some() {
                        found.push(namespaced);
                    }
                }
                return Ok(found);
            }
        };

        Ok(records
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key).into_owned())
            .collect())
    }

    fn delete_matching(&self, op: &'static str, pattern: Option<&str>) -> Result<usize> {
        let deleted = run_rounds(op, || self.delete_round(op, pattern))?;
        debug!(prefix = self.keys.prefix(), "{} deleted {} keys", op, deleted);
        Ok(deleted)
    }

    /// One bounded deletion round.
    fn delete_round(&self, op: &'static str, pattern: Option<&str>) -> Result<usize> {
        let candidates = self.matching_records(op, pattern, DELETE_BATCH_SIZE, None)?;
        if candidates.is_empty() {
            return Ok(0);
        }
        self.delete_candidates(op, &candidates)
    }

    /// Delete scanned `(key, value)` pairs in one transaction. A candidate
    /// rewritten since the scan aborts it with `Error::Conflict`; one deleted
    /// since the scan is skipped.
    fn delete_candidates(&self, op: &'static str, candidates: &[(IVec, IVec)]) -> Result<usize> {
        let result: TransactionResult<(), Error> = self.db.transaction(|tx| {
            for (key, seen) in candidates {
                match tx.get(key)? {
                    Some(current) if current != *seen => {
                        return Err(ConflictableTransactionError::Abort(Error::Conflict(
                            format!("{} changed during {}", String::from_utf8_lossy(key), op),
                        )));
                    }
                    Some(_) => {
                        tx.remove(key.clone())?;
                    }
                    None => {}
                }
            }
            Ok(())
        });

        result.map_err(|e| transaction_error(op, self.keys.prefix(), e))?;
        Ok(candidates.len())
    }
}

/// Drive deletion rounds until one deletes nothing. A round failing with a
/// conflict is retried up to `MAX_CONFLICT_RETRIES` times.
fn run_rounds<F>(op: &'static str, mut round: F) -> Result<usize>
where
    F: FnMut() -> Result<usize>,
{
    let mut total = 0;
    loop {
        let mut retries = 0;
        let deleted = loop {
            match round() {
                Ok(deleted) => break deleted,
                Err(err) if err.is_conflict() => {
                    if retries >= MAX_CONFLICT_RETRIES {
                        return Err(Error::TooManyRetries { op, retries });
                    }
                    retries += 1;
                    warn!(
                        "{}: {}, retrying round ({}/{})",
                        op, err, retries, MAX_CONFLICT_RETRIES
                    );
                }
                Err(err) => return Err(err),
            }
        };

        if deleted == 0 {
            return Ok(total);
        }
        total += deleted;
    }
}

fn storage_error(op: &str, key: &str, err: sled::Error) -> Error {
    match err {
        sled::Error::Corruption { .. } => {
            Error::Internal(format!("{} {}: store corruption: {}", op, key, err))
        }
        other => Error::BackendUnavailable(format!("{} {}: {}", op, key, other)),
    }
}

fn transaction_error(op: &str, key: &str, err: TransactionError<Error>) -> Error {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => storage_error(op, key, err),
    }
}

#[async_trait]
impl Cache for SledCache {
    fn prefix(&self) -> &str {
        self.keys.prefix()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let namespaced = self.keys.key(key);
        Ok(self
            .read_live("exists", &namespaced, record::now_ms())?
            .is_some())
    }

    async fn get(&self, key: &str) -> Result<Value> {
        let namespaced = self.keys.key(key);
        let raw = self
            .db
            .get(namespaced.as_bytes())
            .map_err(|e| storage_error("get", &namespaced, e))?
            .ok_or_else(|| Error::NotFound(namespaced.clone()))?;

        let record = Record::decode(&namespaced, &raw)?;
        if record.is_expired(record::now_ms()) {
            return Err(Error::NotFound(namespaced));
        }
        codec::decode_entry(&namespaced, record.payload)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let namespaced = self.keys.key(key);
        let payload = codec::encode_entry(&namespaced, &value)?;
        let raw = Record::encode(record::expiry_for_write(ttl, record::now_ms()), &payload);

        self.db
            .insert(namespaced.as_bytes(), raw)
            .map_err(|e| storage_error("set", &namespaced, e))?;
        Ok(())
    }

    async fn update(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let namespaced = self.keys.key(key);
        let payload = codec::encode_entry(&namespaced, &value)?;
        let now = record::now_ms();
        let raw = Record::encode(record::expiry_for_write(ttl, now), &payload);

        let result: TransactionResult<(), Error> = self.db.transaction(|tx| {
            match tx.get(namespaced.as_bytes())? {
                Some(current) if record::is_live(&namespaced, &current, now) => {
                    tx.insert(namespaced.as_bytes(), raw.as_slice())?;
                    Ok(())
                }
                _ => Err(ConflictableTransactionError::Abort(Error::KeyDoesNotExist(
                    namespaced.clone(),
                ))),
            }
        });
        result.map_err(|e| transaction_error("update", &namespaced, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let namespaced = self.keys.key(key);
        self.db
            .remove(namespaced.as_bytes())
            .map_err(|e| storage_error("delete", &namespaced, e))?;
        Ok(())
    }

    async fn keys(&self, pattern_or_keys: &[&str]) -> Result<Vec<String>> {
        self.collect_keys(usize::MAX, pattern_or_keys)
    }

    async fn keys_with_batch_size(
        &self,
        batch_size: usize,
        pattern_or_keys: &[&str],
    ) -> Result<Vec<String>> {
        self.collect_keys(effective_batch_size(batch_size), pattern_or_keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let namespaced = self.keys.key(key);
        let now = record::now_ms();
        let expires_at = record::expiry_for_refresh(ttl, now);

        // The expiry lives in the record header, so the value is read and
        // rewritten in the same transaction.
        let result: TransactionResult<(), Error> = self.db.transaction(|tx| {
            let Some(current) = tx.get(namespaced.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(Error::NotFound(
                    namespaced.clone(),
                )));
            };
            let record =
                Record::decode(&namespaced, &current).map_err(ConflictableTransactionError::Abort)?;
            if record.is_expired(now) {
                return Err(ConflictableTransactionError::Abort(Error::NotFound(
                    namespaced.clone(),
                )));
            }
            tx.insert(
                namespaced.as_bytes(),
                Record::encode(Some(expires_at), record.payload),
            )?;
            Ok(())
        });
        result.map_err(|e| transaction_error("expire", &namespaced, e))
    }

    async fn ttl(&self, key: &str) -> Result<Duration> {
        let namespaced = self.keys.key(key);
        let raw = self
            .db
            .get(namespaced.as_bytes())
            .map_err(|e| storage_error("ttl", &namespaced, e))?
            .ok_or_else(|| Error::NotFound(namespaced.clone()))?;

        let now = record::now_ms();
        let record = Record::decode(&namespaced, &raw)?;
        if record.is_expired(now) {
            return Err(Error::NotFound(namespaced));
        }
        Ok(record.remaining(now))
    }

    async fn empty_by_match(&self, pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            return Err(Error::InvalidArgument(
                "empty_by_match requires a non-empty pattern".to_string(),
            ));
        }
        self.delete_matching("empty_by_match", Some(pattern))?;
        Ok(())
    }

    async fn empty(&self) -> Result<()> {
        self.delete_matching("empty", None)?;
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = record::expiry_for_write(ttl, record::now_ms());
        let mut batch = sled::Batch::default();

        for (key, value) in &entries {
            let namespaced = self.keys.key(key);
            let payload = codec::encode_entry(&namespaced, value)?;
            batch.insert(namespaced.as_bytes(), Record::encode(expires_at, &payload));
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| storage_error("set_many", self.keys.prefix(), e))?;
        debug!("set_many wrote {} entries", entries.len());
        Ok(())
    }

    async fn update_many(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = record::now_ms();
        let expires_at = record::expiry_for_write(ttl, now);
        let mut prepared = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            let namespaced = self.keys.key(key);
            let payload = codec::encode_entry(&namespaced, value)?;
            prepared.push((namespaced, Record::encode(expires_at, &payload)));
        }

        let result: TransactionResult<(), Error> = self.db.transaction(|tx| {
            for (namespaced, raw) in &prepared {
                match tx.get(namespaced.as_bytes())? {
                    Some(current) if record::is_live(namespaced, &current, now) => {
                        tx.insert(namespaced.as_bytes(), raw.as_slice())?;
                    }
                    _ => {
                        return Err(ConflictableTransactionError::Abort(
                            Error::KeyDoesNotExist(namespaced.clone()),
                        ));
                    }
                }
            }
            Ok(())
        });
        result.map_err(|e| transaction_error("update_many", self.keys.prefix(), e))
    }

    async fn delete_many(&self, keys: &[&str]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(self.keys.key(key).as_bytes());
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| storage_error("delete_many", self.keys.prefix(), e))
    }

    async fn close(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| storage_error("close", self.keys.prefix(), e))?;
        Ok(())
    }
}

impl std::fmt::Debug for SledCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledCache")
            .field("prefix", &self.keys.prefix())
            .field("entries", &self.db.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_core::CacheExt;
    use serde_json::json;
    use std::cell::Cell;
    use std::sync::Arc;
    use tokio::time::sleep;

    fn temp_cache(prefix: &str) -> SledCache {
        SledCache::open(prefix, &EmbeddedConfig::temporary()).unwrap()
    }

    fn sorted(mut keys: Vec<String>) -> Vec<String> {
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_sled_cache_set_and_get() {
        let cache = temp_cache("test");

        for (key, value) in [
            ("text", json!("value")),
            ("number", json!(42)),
            ("object", json!({"name": "ada", "tags": ["a", "b"]})),
        ] {
            cache.set(key, value.clone(), None).await.unwrap();
            assert_eq!(cache.get(key).await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn test_sled_cache_get_missing_is_not_found() {
        let cache = temp_cache("test");
        let err = cache.get("nonexistent").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(key) if key == "test:nonexistent"));
    }

    #[tokio::test]
    async fn test_sled_cache_exists_and_delete() {
        let cache = temp_cache("test");

        cache.set("foo", json!("value"), None).await.unwrap();
        assert!(cache.exists("foo").await.unwrap());

        cache.delete("foo").await.unwrap();
        assert!(!cache.exists("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_cache_delete_is_idempotent() {
        let cache = temp_cache("test");
        cache.delete("never-written").await.unwrap();
        cache.delete("never-written").await.unwrap();
    }

    #[tokio::test]
    async fn test_sled_cache_update_requires_existing_key() {
        let cache = temp_cache("test");

        let err = cache.update("ghost", json!(1), None).await.unwrap_err();
        assert!(matches!(err, Error::KeyDoesNotExist(_)));

        cache.set("ghost", json!(1), None).await.unwrap();
        cache.delete("ghost").await.unwrap();
        let err = cache.update("ghost", json!(2), None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sled_cache_update_replaces_value_and_ttl() {
        let cache = temp_cache("test");

        cache
            .set("session", json!("v1"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        cache.update("session", json!("v2"), None).await.unwrap();
        assert_eq!(cache.get("session").await.unwrap(), json!("v2"));
        assert_eq!(cache.ttl("session").await.unwrap(), Duration::ZERO);

        cache
            .update("session", json!("v3"), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let ttl = cache.ttl("session").await.unwrap();
        assert!(ttl > Duration::ZERO && ttl <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_sled_cache_ttl_is_bounded_by_requested_duration() {
        let cache = temp_cache("test");
        let five_minutes = Duration::from_secs(300);

        cache.set("k", json!("v"), Some(five_minutes)).await.unwrap();
        let ttl = cache.ttl("k").await.unwrap();
        assert!(ttl > Duration::ZERO);
        assert!(ttl <= five_minutes);

        cache.set("forever", json!("v"), None).await.unwrap();
        assert_eq!(cache.ttl("forever").await.unwrap(), Duration::ZERO);

        assert!(cache.ttl("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sled_cache_entry_expires() {
        let cache = temp_cache("test");

        cache
            .set("k", json!(1), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(cache.exists("k").await.unwrap());

        sleep(Duration::from_secs(2)).await;

        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.get("k").await.unwrap_err().is_not_found());
        assert!(cache.keys(&[]).await.unwrap().is_empty());
        assert!(cache.update("k", json!(2), None).await.is_err());
    }

    #[tokio::test]
    async fn test_sled_cache_expire_sets_ttl() {
        let cache = temp_cache("test");

        cache.set("k", json!("v"), None).await.unwrap();
        cache.expire("k", Duration::from_secs(120)).await.unwrap();
        let ttl = cache.ttl("k").await.unwrap();
        assert!(ttl > Duration::from_secs(100) && ttl <= Duration::from_secs(120));
        assert_eq!(cache.get("k").await.unwrap(), json!("v"));

        let err = cache.expire("missing", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sled_cache_expire_zero_expires_immediately() {
        let cache = temp_cache("test");
        cache.set("k", json!("v"), None).await.unwrap();
        cache.expire("k", Duration::ZERO).await.unwrap();
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_cache_zero_ttl_on_write_never_expires() {
        let cache = temp_cache("test");
        cache.set("k", json!("v"), Some(Duration::ZERO)).await.unwrap();
        assert!(cache.exists("k").await.unwrap());
        assert_eq!(cache.ttl("k").await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_sled_cache_keys_call_shapes() {
        let cache = temp_cache("test");
        for key in ["user:1", "user:2", "order:1"] {
            cache.set(key, json!(key), None).await.unwrap();
        }

        assert_eq!(
            sorted(cache.keys(&[]).await.unwrap()),
            vec!["test:order:1", "test:user:1", "test:user:2"]
        );
        assert_eq!(
            sorted(cache.keys(&["user*"]).await.unwrap()),
            vec!["test:user:1", "test:user:2"]
        );
        assert_eq!(
            cache.keys(&["*:1"]).await.unwrap().len(),
            2,
            "suffix pattern matches user:1 and order:1"
        );
        assert_eq!(cache.keys(&["order:1"]).await.unwrap(), vec!["test:order:1"]);
        assert!(cache.keys(&["order:2"]).await.unwrap().is_empty());
        assert_eq!(
            cache.keys(&["user:2", "missing", "order:1"]).await.unwrap(),
            vec!["test:user:2", "test:order:1"]
        );
    }

    #[tokio::test]
    async fn test_sled_cache_namespace_isolation() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let app = SledCache::with_db("app", db.clone()).unwrap();
        let application = SledCache::with_db("application", db).unwrap();

        app.set("a", json!(1), None).await.unwrap();
        application.set("b", json!(2), None).await.unwrap();

        assert_eq!(app.keys(&[]).await.unwrap(), vec!["app:a"]);
        assert_eq!(application.keys(&[]).await.unwrap(), vec!["application:b"]);

        app.empty().await.unwrap();
        assert!(application.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_cache_nested_prefix_is_rejected() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let outer = SledCache::with_db("a", db.clone()).unwrap();
        let err = SledCache::with_db("a:b", db.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // the closest legal neighbour stays invisible to `a`
        let neighbour = SledCache::with_db("ab", db).unwrap();
        neighbour.set("k", json!(1), None).await.unwrap();
        assert!(outer.keys(&[]).await.unwrap().is_empty());
        outer.empty().await.unwrap();
        assert!(neighbour.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_cache_keys_with_batch_size() {
        let cache = temp_cache("test");
        let entries = (0..25)
            .map(|i| (format!("item:{i:02}"), json!(i)))
            .collect();
        cache.set_many(entries, None).await.unwrap();

        assert_eq!(cache.keys_with_batch_size(10, &[]).await.unwrap().len(), 10);
        assert_eq!(
            cache.keys_with_batch_size(5, &["item:1*"]).await.unwrap().len(),
            5
        );
        assert_eq!(cache.keys_with_batch_size(0, &[]).await.unwrap().len(), 25);
        assert_eq!(
            cache
                .keys_with_batch_size(2, &["item:01", "item:02", "item:03"])
                .await
                .unwrap(),
            vec!["test:item:01", "test:item:02"]
        );
    }

    #[tokio::test]
    async fn test_sled_cache_empty_by_match_spans_multiple_rounds() {
        let cache = temp_cache("test");
        let matching = DELETE_BATCH_SIZE + 2_500;

        let sessions = (0..matching)
            .map(|i| (format!("session:{i}"), json!(i)))
            .collect();
        cache.set_many(sessions, None).await.unwrap();
        let users = (0..40).map(|i| (format!("user:{i}"), json!(i))).collect();
        cache.set_many(users, None).await.unwrap();

        cache.empty_by_match("session*").await.unwrap();

        let remaining = cache.keys(&[]).await.unwrap();
        assert_eq!(remaining.len(), 40);
        assert!(remaining.iter().all(|k| k.starts_with("test:user:")));
    }

    #[tokio::test]
    async fn test_sled_cache_rewritten_candidate_aborts_deletion() {
        let cache = temp_cache("test");
        cache.set("a", json!(1), None).await.unwrap();
        cache.set("b", json!(2), None).await.unwrap();

        let candidates = cache
            .matching_records("empty", None, DELETE_BATCH_SIZE, None)
            .unwrap();
        cache.set("b", json!("rewritten"), None).await.unwrap();

        let err = cache.delete_candidates("empty", &candidates).unwrap_err();
        assert!(err.is_conflict());
        assert!(cache.exists("a").await.unwrap(), "aborted round deletes nothing");
        assert_eq!(cache.get("b").await.unwrap(), json!("rewritten"));

        let candidates = cache
            .matching_records("empty", None, DELETE_BATCH_SIZE, None)
            .unwrap();
        cache.delete("a").await.unwrap();
        assert_eq!(cache.delete_candidates("empty", &candidates).unwrap(), 2);
        assert!(cache.keys(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sled_cache_empty_alongside_concurrent_writer() {
        let cache = temp_cache("test");
        let entries = (0..3_000).map(|i| (format!("old:{i}"), json!(i))).collect();
        cache.set_many(entries, None).await.unwrap();

        let db = cache.db.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..2_000 {
                let key = format!("test:new:{i}");
                let payload = codec::encode_entry(&key, &json!(i)).unwrap();
                db.insert(key.as_bytes(), Record::encode(None, &payload))
                    .unwrap();
            }
        });

        cache.empty().await.unwrap();
        writer.join().unwrap();

        assert!(cache.keys(&["old*"]).await.unwrap().is_empty());
        assert!(cache.keys(&["new*"]).await.unwrap().len() <= 2_000);
    }

    #[tokio::test]
    async fn test_sled_cache_empty_by_match_honours_suffix() {
        let cache = temp_cache("test");
        for key in ["post:1:draft", "post:2:published", "page:3:draft"] {
            cache.set(key, json!(key), None).await.unwrap();
        }

        cache.empty_by_match("post*draft").await.unwrap();
        assert_eq!(
            sorted(cache.keys(&[]).await.unwrap()),
            vec!["test:page:3:draft", "test:post:2:published"]
        );

        cache.empty_by_match("*draft").await.unwrap();
        assert_eq!(cache.keys(&[]).await.unwrap(), vec!["test:post:2:published"]);
    }

    #[tokio::test]
    async fn test_sled_cache_empty_by_match_rejects_empty_pattern() {
        let cache = temp_cache("test");
        let err = cache.empty_by_match("").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_sled_cache_empty() {
        let cache = temp_cache("test");
        cache.set("a", json!(1), None).await.unwrap();
        cache.set("b", json!(2), Some(Duration::from_secs(60))).await.unwrap();

        cache.empty().await.unwrap();
        assert!(cache.keys(&[]).await.unwrap().is_empty());
        assert_eq!(cache.size().unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_sled_cache_bulk_writes() {
        let cache = temp_cache("test");
        cache
            .set_many(
                vec![("key1".into(), json!("value1")), ("key2".into(), json!("value2"))],
                Some(Duration::from_secs(300)),
            )
            .await
            .unwrap();
        assert_eq!(cache.get("key1").await.unwrap(), json!("value1"));
        assert!(cache.ttl("key2").await.unwrap() > Duration::ZERO);

        cache
            .update_many(vec![("key1".into(), json!("updated"))], None)
            .await
            .unwrap();
        assert_eq!(cache.get("key1").await.unwrap(), json!("updated"));

        cache.delete_many(&["key1", "key2", "never"]).await.unwrap();
        assert!(cache.keys(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sled_cache_update_many_is_all_or_nothing() {
        let cache = temp_cache("test");
        cache.set("present", json!("old"), None).await.unwrap();

        let err = cache
            .update_many(
                vec![
                    ("present".into(), json!("new")),
                    ("absent".into(), json!("new")),
                ],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyDoesNotExist(key) if key == "test:absent"));
        assert_eq!(cache.get("present").await.unwrap(), json!("old"));
        assert!(!cache.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_cache_corrupt_record_is_encoding_error() {
        let cache = temp_cache("test");
        cache.db.insert("test:broken", &b"xy"[..]).unwrap();
        let err = cache.get("broken").await.unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));

        let foreign = Record::encode(None, &codec::encode_entry("test:other", &json!(1)).unwrap());
        cache.db.insert("test:moved", foreign).unwrap();
        let err = cache.get("moved").await.unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[tokio::test]
    async fn test_sled_cache_typed_access_through_handle() {
        let cache: cache_core::CacheHandle = Arc::new(temp_cache("test"));
        cache.set_as("numbers", &vec![1u32, 2, 3], None).await.unwrap();
        let numbers: Vec<u32> = cache.get_as("numbers").await.unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(cache.backend(), BackendKind::Embedded);
    }

    #[tokio::test]
    async fn test_sled_cache_backup_and_restore() {
        let source = temp_cache("test");
        source.set("a", json!("alpha"), None).await.unwrap();
        source
            .set("b", json!({"beta": true}), Some(Duration::from_secs(600)))
            .await
            .unwrap();

        let mut snapshot = Vec::new();
        let written = source.backup(&mut snapshot).unwrap();
        assert_eq!(written, 2);

        let target = temp_cache("test");
        let loaded = target.restore(snapshot.as_slice()).unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(target.get("a").await.unwrap(), json!("alpha"));
        assert_eq!(target.get("b").await.unwrap(), json!({"beta": true}));
        assert!(target.ttl("b").await.unwrap() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_sled_cache_run_gc_purges_expired() {
        let cache = temp_cache("test");
        cache
            .set("short", json!(1), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        cache.set("long", json!(2), None).await.unwrap();

        sleep(Duration::from_millis(120)).await;

        assert_eq!(cache.run_gc().unwrap(), 1);
        assert_eq!(cache.size().unwrap().entries, 1);
        assert!(cache.exists("long").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_cache_drop_prefix_and_clear() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let mine = SledCache::with_db("mine", db.clone()).unwrap();
        let theirs = SledCache::with_db("theirs", db).unwrap();
        mine.set("a", json!(1), None).await.unwrap();
        mine.set("b", json!(2), None).await.unwrap();
        theirs.set("c", json!(3), None).await.unwrap();

        assert_eq!(mine.drop_prefix().unwrap(), 2);
        assert!(theirs.exists("c").await.unwrap());

        theirs.clear().unwrap();
        assert_eq!(theirs.size().unwrap().entries, 0);
    }

    #[test]
    fn test_run_rounds_stops_on_empty_round() {
        let mut rounds = vec![10_000, 10_000, 42, 0].into_iter();
        let total = run_rounds("empty", || Ok(rounds.next().unwrap_or(0))).unwrap();
        assert_eq!(total, 20_042);
    }

    #[test]
    fn test_run_rounds_retries_conflicts() {
        let attempts = Cell::new(0);
        let total = run_rounds("empty", || {
            attempts.set(attempts.get() + 1);
            match attempts.get() {
                1 | 2 => Err(Error::Conflict("test:k changed".into())),
                3 => Ok(5),
                _ => Ok(0),
            }
        })
        .unwrap();
        assert_eq!(total, 5);
        assert_eq!(attempts.get(), 4);
    }

    #[test]
    fn test_run_rounds_gives_up_after_max_retries() {
        let attempts = Cell::new(0);
        let err = run_rounds("empty_by_match", || {
            attempts.set(attempts.get() + 1);
            Err(Error::Conflict("always".into()))
        })
        .unwrap_err();
        assert!(matches!(
            err,
            Error::TooManyRetries { op: "empty_by_match", retries } if retries == MAX_CONFLICT_RETRIES
        ));
        assert_eq!(attempts.get(), MAX_CONFLICT_RETRIES + 1);
    }

    #[test]
    fn test_run_rounds_propagates_other_errors() {
        let err = run_rounds("empty", || Err(Error::BackendUnavailable("io".into()))).unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }
}
