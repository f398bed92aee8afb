// ABOUTME: Defines the storage envelope wrapping every persisted value and its text codec.
// ABOUTME: Envelopes carry the logical key, write timestamp, version tag, and optional expiry.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding or decoding an envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The wrapper record persisted under every namespaced key. No raw,
/// un-enveloped value is ever written to the substrate.
///
/// Timestamps serialize as integer milliseconds since the epoch, and the
/// expiry field is omitted entirely when the entry never expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEnvelope<T> {
    /// Logical key as supplied by the caller, unprefixed.
    pub key: String,
    pub value: T,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Build-wide version tag. A mismatch against the running tag is
    /// detected on read but not currently acted on.
    pub version: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T: Serialize> StorageEnvelope<T> {
    /// Wrap a value for persistence, stamping the write time with the
    /// current wall clock. The caller never supplies the timestamp.
    pub fn wrap(
        key: impl Into<String>,
        value: T,
        version: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: Utc::now(),
            version: version.into(),
            expires_at,
        }
    }

    /// Serialize to the substrate's text format.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> StorageEnvelope<T> {
    /// Deserialize from the substrate's text format. A failure here means
    /// the entry is corrupt, which callers must treat as a distinct state
    /// from "absent" and "stale".
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }
}
