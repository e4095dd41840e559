#![deny(clippy::all)]

//! Storage backends for the cache contract: an embedded sled store and a
//! remote Redis store, plus the factory that picks one at startup.

pub mod factory;
pub mod maintenance;
pub mod record;
pub mod redis_cache;
pub mod sled_cache;
pub mod snapshot;

pub use factory::UnifiedStorageFactory;
pub use maintenance::spawn_expiry_sweeper;
pub use redis_cache::RedisCache;
pub use sled_cache::SledCache;
