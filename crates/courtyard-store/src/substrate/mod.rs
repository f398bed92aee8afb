// ABOUTME: The host substrate trait: synchronous, origin-scoped, capacity-limited key-value text storage.
// ABOUTME: Defines substrate failures, origin-wide change broadcasts, and per-handle context identity.

use std::sync::atomic::{AtomicU64, Ordering};

use courtyard_core::StoreError;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod sqlite;

pub use memory::MemorySubstrate;
pub use sqlite::SqliteSubstrate;

/// Capacity ceiling of the shared origin, 5 MiB. Compiled in rather than
/// queried from the host at runtime.
pub const DEFAULT_CAPACITY_BYTES: usize = 5 * 1024 * 1024;

/// Failures a substrate operation can report.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("quota exceeded: {needed} bytes needed, capacity is {capacity}")]
    QuotaExceeded { needed: usize, capacity: usize },

    #[error("storage access denied")]
    AccessDenied,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Classification of substrate failures into the public taxonomy. Total:
/// anything that is not capacity exhaustion or access denial degrades to
/// `InvalidData` rather than propagating unclassified.
impl From<SubstrateError> for StoreError {
    fn from(err: SubstrateError) -> Self {
        let message = err.to_string();
        match err {
            e @ SubstrateError::QuotaExceeded { .. } => StoreError::QuotaExceeded {
                message,
                source: Some(Box::new(e)),
            },
            e @ SubstrateError::AccessDenied => StoreError::StorageDisabled {
                message,
                source: Some(Box::new(e)),
            },
            e @ SubstrateError::Sqlite(_) => StoreError::InvalidData {
                message,
                source: Some(Box::new(e)),
            },
        }
    }
}

/// A raw physical-key mutation, broadcast to every handle attached to the
/// same origin. `context` identifies the handle that performed the write so
/// receivers can ignore their own mutations.
#[derive(Debug, Clone)]
pub struct SubstrateChange {
    pub context: u64,
    pub key: String,
    pub old_value: Option<String>,
    /// None means the key was removed.
    pub new_value: Option<String>,
}

/// The synchronous host storage every store instance sits on. Keys and
/// values are text; capacity is a hard ceiling over the whole origin.
///
/// Implementations complete every call within the same turn. The public
/// store contract above this stays async-shaped so a backing engine with
/// real latency can be substituted without changing call sites.
pub trait Substrate: Send + Sync {
    /// Read a value. `Ok(None)` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>, SubstrateError>;

    /// Write a value, overwriting any previous one. Fails with
    /// `QuotaExceeded` when the write would push the origin past capacity,
    /// leaving the prior value untouched.
    fn set(&self, key: &str, value: &str) -> Result<(), SubstrateError>;

    /// Remove a key, returning the previous value if one existed.
    fn remove(&self, key: &str) -> Result<Option<String>, SubstrateError>;

    /// All physical keys currently present, in unspecified order.
    fn keys(&self) -> Result<Vec<String>, SubstrateError>;

    /// Bytes currently consumed across the whole origin (key + value
    /// lengths summed over every entry, foreign applications included).
    fn used(&self) -> Result<usize, SubstrateError>;

    /// The origin's capacity ceiling in bytes.
    fn capacity(&self) -> usize;

    /// Identity of this handle within its origin. Changes broadcast with
    /// the originating handle's context so subscribers can skip their own.
    fn context_id(&self) -> u64;

    /// Subscribe to origin-wide change notifications.
    fn changes(&self) -> broadcast::Receiver<SubstrateChange>;
}

/// Hands out process-unique context ids for substrate handles.
pub(crate) fn next_context_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
