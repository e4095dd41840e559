#![deny(clippy::all)]

pub mod codec;
pub mod domain;
pub mod keyspace;
pub mod ports;
pub mod wildcard;

pub use domain::{BackendKind, StoreSize};
pub use keyspace::KeySpace;
pub use ports::{Cache, CacheExt, CacheHandle};
pub use serde_json::Value;
