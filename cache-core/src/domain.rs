use std::fmt;

/// Concrete store behind a cache handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Embedded,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Embedded => write!(f, "embedded"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

/// Footprint reported by the embedded store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreSize {
    pub disk_bytes: u64,
    pub entries: usize,
}

/// Default page size for `keys_with_batch_size(0, ..)`.
pub const DEFAULT_KEYS_BATCH_SIZE: usize = 1000;

pub fn effective_batch_size(batch_size: usize) -> usize {
    if batch_size == 0 {
        DEFAULT_KEYS_BATCH_SIZE
    } else {
        batch_size
    }
}
