//! # Key Envelope Primitives
//!
//! Every transit key serializes to a self-describing byte envelope so that it
//! can round-trip through the packed-key cache without any side-channel
//! metadata. The layout is a sequence of `0xFF`-separated fields followed by
//! raw key material:
//!
//! ```text
//! type 0xFF size 0xFF name 0xFF created-at 0xFF ttl 0xFF <material...>
//! ```
//!
//! The trailing material segment is opaque binary and may itself contain
//! `0xFF` bytes, so parsing splits at most `field count − 1` times and leaves
//! the final segment intact. Timestamps are RFC 3339 at second precision;
//! TTLs are human-readable duration literals (`25m`, `1h30m`, `0s`).

use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;
use thiserror::Error;

/// Field separator for packed key envelopes.
pub const SEPARATOR_BYTE: u8 = 0xFF;

/// Envelope encoding/decoding errors
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Wrong field count or non-UTF-8 text field
    #[error("invalid envelope format: {0}")]
    InvalidFormat(String),

    /// Creation timestamp failed to parse
    #[error("invalid created-at timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    /// TTL literal failed to parse
    #[error("invalid ttl: {0}")]
    InvalidTtl(#[from] humantime::DurationError),

    /// Material segment shorter than the variant requires
    #[error("key material too short: expected at least {expected} bytes, got {actual}")]
    MaterialTooShort {
        /// Minimum number of material bytes the variant requires
        expected: usize,
        /// Number of bytes actually present
        actual: usize,
    },
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Split `data` into exactly `count` fields on [`SEPARATOR_BYTE`].
///
/// Splits at most `count − 1` times; the final element is the raw remainder
/// and may contain separator bytes. Returns an error when fewer than `count`
/// fields are present.
pub fn split_fields(data: &[u8], count: usize) -> EnvelopeResult<Vec<&[u8]>> {
    let mut parts = Vec::with_capacity(count);
    let mut rest = data;

    for _ in 0..count - 1 {
        match rest.iter().position(|&b| b == SEPARATOR_BYTE) {
            Some(idx) => {
                parts.push(&rest[..idx]);
                rest = &rest[idx + 1..];
            }
            None => {
                return Err(EnvelopeError::InvalidFormat(format!(
                    "expected {} fields, found {}",
                    count,
                    parts.len() + 1
                )))
            }
        }
    }
    parts.push(rest);

    Ok(parts)
}

/// Decode a text field as UTF-8.
pub fn text_field(field: &[u8]) -> EnvelopeResult<&str> {
    std::str::from_utf8(field)
        .map_err(|_| EnvelopeError::InvalidFormat("non-utf8 text field".to_string()))
}

/// Format a creation timestamp for packing (RFC 3339, second precision).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a packed creation timestamp.
pub fn parse_timestamp(field: &[u8]) -> EnvelopeResult<DateTime<Utc>> {
    let text = text_field(field)?;
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

/// Format a TTL as a duration literal (`25m`, `1h30m`). Zero is `0s`.
pub fn format_ttl(ttl: Duration) -> String {
    if ttl.is_zero() {
        return "0s".to_string();
    }
    humantime::format_duration(ttl).to_string()
}

/// Parse a TTL duration literal.
pub fn parse_ttl(field: &[u8]) -> EnvelopeResult<Duration> {
    let text = text_field(field)?;
    Ok(humantime::parse_duration(text)?)
}

/// Incremental writer for packed key envelopes.
///
/// Text fields are terminated with the separator; material segments are
/// appended raw at the end.
pub struct EnvelopeWriter {
    buf: Vec<u8>,
}

impl EnvelopeWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a separator-terminated text field.
    pub fn field(&mut self, text: &str) {
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(SEPARATOR_BYTE);
    }

    /// Append raw material bytes (no separator).
    pub fn material(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Finish and take the packed bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for EnvelopeWriter {
    fn default() -> Self {
        Self::new()
    }
}
