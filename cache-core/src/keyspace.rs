use crate::wildcard;
use shared::{Error, Result};
use std::sync::Arc;

pub const KEY_SEPARATOR: char = ':';

/// Key layout of one cache instance: `prefix:logicalKey`.
///
/// Both backends build every key through this type so that their key
/// formatting is byte-identical.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    prefix: Arc<str>,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix: String = prefix.into();
        if prefix.is_empty() {
            return Err(Error::InvalidArgument(
                "cache prefix must not be empty".to_string(),
            ));
        }
        // a separator would put this namespace inside another one
        if prefix.contains(KEY_SEPARATOR) {
            return Err(Error::InvalidArgument(format!(
                "cache prefix '{}' must not contain '{}'",
                prefix, KEY_SEPARATOR
            )));
        }
        Ok(Self {
            prefix: prefix.into(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Namespaced key for a logical key.
    pub fn key(&self, logical: &str) -> String {
        format!("{}{}{}", self.prefix, KEY_SEPARATOR, logical)
    }

    /// `prefix:`, the byte prefix shared by every key of this instance.
    pub fn namespace(&self) -> String {
        self.key("")
    }

    /// Strip the namespace, returning the logical key name.
    pub fn logical<'a>(&self, namespaced: &'a str) -> Option<&'a str> {
        namespaced
            .strip_prefix(self.prefix.as_ref())
            .and_then(|rest| rest.strip_prefix(KEY_SEPARATOR))
    }

    /// Byte prefix to seek to when scanning for `pattern`.
    pub fn seek_prefix(&self, pattern: &str) -> String {
        self.key(wildcard::literal_prefix(pattern))
    }

    /// Remote glob matching `pattern` inside this namespace. The prefix is
    /// matched literally; only the `*` of the pattern stays live.
    pub fn glob(&self, pattern: &str) -> String {
        format!(
            "{}{}{}",
            wildcard::escape_glob(&self.prefix, false),
            KEY_SEPARATOR,
            wildcard::escape_glob(pattern, true)
        )
    }
}
