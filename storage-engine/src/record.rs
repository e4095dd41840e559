//! Stored layout of an embedded-store record: an 8-byte big-endian expiry
//! timestamp (milliseconds since the Unix epoch, `0` = never) followed by the
//! encoded entry.

use bytes::{Buf, BufMut, BytesMut};
use shared::{Error, Result};
use std::time::Duration;

pub const HEADER_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<'a> {
    pub expires_at_ms: Option<u64>,
    pub payload: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn encode(expires_at_ms: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u64(expires_at_ms.unwrap_or(0));
        buf.put_slice(payload);
        buf.to_vec()
    }

    pub fn decode(key: &str, raw: &'a [u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::Encoding(format!(
                "record for {} is truncated ({} bytes)",
                key,
                raw.len()
            )));
        }
        let mut header = &raw[..HEADER_LEN];
        let expires_at_ms = match header.get_u64() {
            0 => None,
            at => Some(at),
        };
        Ok(Self {
            expires_at_ms,
            payload: &raw[HEADER_LEN..],
        })
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    /// Remaining lifetime; zero for records that never expire.
    pub fn remaining(&self, now_ms: u64) -> Duration {
        match self.expires_at_ms {
            Some(at) => Duration::from_millis(at.saturating_sub(now_ms)),
            None => Duration::ZERO,
        }
    }
}

pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Absolute expiry for a TTL given on write. Zero means no expiry.
pub fn expiry_for_write(ttl: Option<Duration>, now_ms: u64) -> Option<u64> {
    ttl.map(duration_ms)
        .filter(|ms| *ms > 0)
        .map(|ms| now_ms.saturating_add(ms))
}

/// Absolute expiry for an explicit `expire`. Zero expires immediately.
pub fn expiry_for_refresh(ttl: Duration, now_ms: u64) -> u64 {
    now_ms.saturating_add(duration_ms(ttl)).max(1)
}

pub fn duration_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Whether a raw record is live. Records that fail to decode count as live so
/// that the caller surfaces the decoding error instead of hiding the key.
pub fn is_live(key: &str, raw: &[u8], now_ms: u64) -> bool {
    Record::decode(key, raw).map_or(true, |record| !record.is_expired(now_ms))
}
