use crate::{RedisCache, SledCache};
use cache_core::CacheHandle;
use cache_core::ports::StorageFactory;
use shared::Result;
use shared::config::{BackendConfig, CacheConfig};
use std::sync::Arc;
use tracing::info;

/// Builds whichever backend the configuration selects.
pub struct UnifiedStorageFactory;

impl StorageFactory for UnifiedStorageFactory {
    fn create_from_config(&self, config: &CacheConfig) -> Result<CacheHandle> {
        let cache: CacheHandle = match &config.backend {
            BackendConfig::Embedded(embedded) => Arc::new(SledCache::open(&config.prefix, embedded)?),
            BackendConfig::Remote(remote) => Arc::new(RedisCache::connect(&config.prefix, remote)?),
        };
        info!(prefix = %config.prefix, backend = %cache.backend(), "cache ready");
        Ok(cache)
    }
}
