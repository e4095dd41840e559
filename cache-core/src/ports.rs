use crate::domain::BackendKind;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::config::CacheConfig;
use shared::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

// Ports are the pluggable extension points for the underlying stores

/// Shared handle passed to every collaborator that needs the cache.
pub type CacheHandle = Arc<dyn Cache>;

/// Port for creating a cache from configuration.
pub trait StorageFactory: Send + Sync + 'static {
    fn create_from_config(&self, config: &CacheConfig) -> Result<CacheHandle>;
}

/// Uniform cache contract satisfied by every backend.
///
/// Keys are logical keys; the backend namespaces them with its prefix.
/// Key listings return namespaced keys.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    fn prefix(&self) -> &str;

    fn backend(&self) -> BackendKind;

    /// True iff the key resolves to a live, non-expired entry.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Decoded value, or `Error::NotFound` on a miss.
    async fn get(&self, key: &str) -> Result<Value>;

    /// Unconditional write. A zero TTL means no expiry.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Like `set`, but fails with `Error::KeyDoesNotExist` when the key is absent.
    /// Value and TTL are replaced wholesale.
    async fn update(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// No arguments: every key of the instance. One argument containing `*`:
    /// wildcard match. Otherwise each argument is an exact key, kept if it exists.
    async fn keys(&self, pattern_or_keys: &[&str]) -> Result<Vec<String>>;

    /// `keys` capped at `batch_size` results; zero selects the default of 1000.
    async fn keys_with_batch_size(
        &self,
        batch_size: usize,
        pattern_or_keys: &[&str],
    ) -> Result<Vec<String>>;

    /// Set or replace the TTL of an existing key. Zero expires it immediately.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remaining time to live; zero when the key never expires.
    async fn ttl(&self, key: &str) -> Result<Duration>;

    async fn empty_by_match(&self, pattern: &str) -> Result<()>;

    async fn empty(&self) -> Result<()>;

    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> Result<()>;

    /// Fails without writing anything if any key is absent.
    async fn update_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>)
    -> Result<()>;

    async fn delete_many(&self, keys: &[&str]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Typed access on top of the `Value` container. The caller names the
/// concrete type on read.
#[async_trait]
pub trait CacheExt: Cache {
    async fn get_as<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        let value = self.get(key).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Encoding(format!("value of {} has unexpected shape: {}", key, e)))
    }

    async fn set_as<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = to_value(key, value)?;
        self.set(key, value, ttl).await
    }

    async fn update_as<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = to_value(key, value)?;
        self.update(key, value, ttl).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

fn to_value<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::Encoding(format!("failed to encode {}: {}", key, e)))
}
