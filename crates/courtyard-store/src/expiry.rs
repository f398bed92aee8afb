// ABOUTME: Item-level expiry policy: staleness is a pure function of wall-clock time.
// ABOUTME: Entries are evicted lazily on read; there is deliberately no background sweep.

use chrono::{DateTime, Duration, Utc};
use courtyard_core::StorageEnvelope;

/// Per-write options for the store facade.
///
/// A zero or negative `expires_in` is legal and degenerates to "expires
/// immediately": the entry lands in storage already stale and is evicted
/// the first time it is read.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub expires_in: Option<Duration>,
}

impl SetOptions {
    pub fn expires_in(duration: Duration) -> Self {
        Self {
            expires_in: Some(duration),
        }
    }
}

/// An entry is stale iff it carries an expiry instant that `now` has passed.
/// Entries without one never expire.
pub fn is_stale<T>(envelope: &StorageEnvelope<T>, now: DateTime<Utc>) -> bool {
    matches!(envelope.expires_at, Some(at) if now > at)
}
