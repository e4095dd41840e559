// shared/src/lib.rs

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key does not exist: {0}")]
    KeyDoesNotExist(String),
    #[error("encoding: {0}")]
    Encoding(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("too many retries: {op} still conflicting after {retries} retries")]
    TooManyRetries { op: &'static str, retries: usize },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// True for both flavours of a missing key (read miss and update precondition).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::KeyDoesNotExist(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type CacheError = Error;
pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
