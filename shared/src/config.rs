use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Which store backs a cache instance. Chosen once at startup.
#[derive(Clone, Debug)]
pub enum BackendConfig {
    Embedded(EmbeddedConfig),
    Remote(RemoteConfig),
}

#[derive(Clone, Debug)]
pub struct EmbeddedConfig {
    pub path: PathBuf,
    pub cache_capacity_bytes: u64,
    pub flush_every_ms: Option<u64>,
    /// Sweep interval for expired records; `None` disables the sweeper.
    pub gc_interval: Option<Duration>,
    /// Store is deleted when the handle is dropped (tests and scratch use).
    pub temporary: bool,
}

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub host: String,
    pub password: Option<String>,
    pub db: u32,
    pub pool_max_size: usize,
    pub pool_wait_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub prefix: String,
    pub backend: BackendConfig,
}

impl EmbeddedConfig {
    const DEFAULT_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;
    const DEFAULT_FLUSH_MS: u64 = 500;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_capacity_bytes: Self::DEFAULT_CAPACITY_BYTES,
            flush_every_ms: Some(Self::DEFAULT_FLUSH_MS),
            gc_interval: None,
            temporary: false,
        }
    }

    /// A throwaway store under the system temp directory.
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::new(std::env::temp_dir().join("cache-engine-scratch"))
        }
    }
}

impl RemoteConfig {
    const DEFAULT_POOL_MAX_SIZE: usize = 50;
    const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;

    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            password: None,
            db: 0,
            pool_max_size: Self::DEFAULT_POOL_MAX_SIZE,
            pool_wait_timeout: Duration::from_millis(Self::DEFAULT_WAIT_TIMEOUT_MS),
        }
    }

    /// Connection URL in the `redis://[:password@]host[/db]` form.
    pub fn url(&self) -> String {
        let host = self
            .host
            .trim_start_matches("redis://")
            .trim_end_matches('/');
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}/{}", password, host, self.db)
            }
            _ => format!("redis://{}/{}", host, self.db),
        }
    }
}

impl CacheConfig {
    const DEFAULT_PREFIX: &'static str = "cache";
    const DEFAULT_DATA_DIR: &'static str = "./data/cache";
    const DEFAULT_REDIS_HOST: &'static str = "127.0.0.1:6379";

    pub fn new(prefix: impl Into<String>, backend: BackendConfig) -> Self {
        Self {
            prefix: prefix.into(),
            backend,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = lookup("CACHE_PREFIX")
            .or_else(|| lookup("REDIS_PREFIX"))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| {
                warn!(
                    "CACHE_PREFIX not set, using default prefix '{}'",
                    Self::DEFAULT_PREFIX
                );
                Self::DEFAULT_PREFIX.to_string()
            });

        let kind = lookup("CACHE").unwrap_or_else(|| "sled".to_string());
        let backend = match kind.trim().to_ascii_lowercase().as_str() {
            "sled" | "badger" | "embedded" => {
                let mut embedded = EmbeddedConfig::new(
                    lookup("CACHE_DATA_DIR").unwrap_or_else(|| Self::DEFAULT_DATA_DIR.to_string()),
                );
                if let Some(bytes) = parse_var(&lookup, "CACHE_SLED_CAPACITY_BYTES")? {
                    embedded.cache_capacity_bytes = bytes;
                }
                if let Some(ms) = parse_var(&lookup, "CACHE_SLED_FLUSH_MS")? {
                    embedded.flush_every_ms = if ms == 0 { None } else { Some(ms) };
                }
                embedded.gc_interval = parse_var::<u64, _>(&lookup, "CACHE_GC_INTERVAL_SECS")?
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs);
                BackendConfig::Embedded(embedded)
            }
            "redis" | "remote" => {
                let mut remote = RemoteConfig::new(
                    lookup("REDIS_HOST").unwrap_or_else(|| Self::DEFAULT_REDIS_HOST.to_string()),
                );
                remote.password = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty());
                if let Some(db) = parse_var(&lookup, "REDIS_DB")? {
                    remote.db = db;
                }
                if let Some(size) = parse_var(&lookup, "REDIS_POOL_MAX_SIZE")? {
                    remote.pool_max_size = size;
                }
                if let Some(ms) = parse_var(&lookup, "REDIS_POOL_WAIT_TIMEOUT_MS")? {
                    remote.pool_wait_timeout = Duration::from_millis(ms);
                }
                BackendConfig::Remote(remote)
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported cache backend '{}' (expected sled or redis)",
                    other
                )));
            }
        };

        Ok(Self { prefix, backend })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            Error::InvalidArgument(format!("{} has invalid value '{}': {}", name, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_to_embedded_backend() {
        let config = CacheConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.prefix, "cache");
        match config.backend {
            BackendConfig::Embedded(embedded) => {
                assert_eq!(embedded.path, PathBuf::from("./data/cache"));
                assert!(embedded.gc_interval.is_none());
                assert!(!embedded.temporary);
            }
            other => panic!("expected embedded backend, got {:?}", other),
        }
    }

    #[test]
    fn test_badger_alias_and_sled_tuning() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("CACHE", "badger"),
            ("CACHE_PREFIX", "app"),
            ("CACHE_DATA_DIR", "/var/lib/app/cache"),
            ("CACHE_SLED_FLUSH_MS", "0"),
            ("CACHE_GC_INTERVAL_SECS", "86400"),
        ]))
        .unwrap();
        assert_eq!(config.prefix, "app");
        let BackendConfig::Embedded(embedded) = config.backend else {
            panic!("expected embedded backend");
        };
        assert_eq!(embedded.path, PathBuf::from("/var/lib/app/cache"));
        assert_eq!(embedded.flush_every_ms, None);
        assert_eq!(embedded.gc_interval, Some(Duration::from_secs(86400)));
    }

    #[test]
    fn test_redis_backend_from_env() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("CACHE", "redis"),
            ("REDIS_PREFIX", "sessions"),
            ("REDIS_HOST", "cache.internal:6380"),
            ("REDIS_PASSWORD", "s3cret"),
            ("REDIS_POOL_MAX_SIZE", "8"),
        ]))
        .unwrap();
        assert_eq!(config.prefix, "sessions");
        let BackendConfig::Remote(remote) = config.backend else {
            panic!("expected remote backend");
        };
        assert_eq!(remote.pool_max_size, 8);
        assert_eq!(remote.url(), "redis://:s3cret@cache.internal:6380/0");
    }

    #[test]
    fn test_remote_url_without_password() {
        let remote = RemoteConfig::new("redis://localhost:6379/");
        assert_eq!(remote.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = CacheConfig::from_lookup(lookup_from(&[("CACHE", "memcached")])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_bad_number_is_rejected() {
        let err = CacheConfig::from_lookup(lookup_from(&[
            ("CACHE", "redis"),
            ("REDIS_POOL_MAX_SIZE", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("REDIS_POOL_MAX_SIZE"));
    }
}
