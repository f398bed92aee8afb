// ABOUTME: In-memory substrate with strict quota accounting and shared-origin handles.
// ABOUTME: Two attached handles model two tabs of one origin; every mutation broadcasts to siblings.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::substrate::{
    DEFAULT_CAPACITY_BYTES, Substrate, SubstrateChange, SubstrateError, next_context_id,
};

/// State shared by every handle attached to one origin.
struct OriginShared {
    data: Mutex<BTreeMap<String, String>>,
    capacity: usize,
    changes_tx: broadcast::Sender<SubstrateChange>,
}

/// An in-memory substrate handle. Cloning an origin across handles via
/// [`MemorySubstrate::attach`] models multiple execution contexts (tabs)
/// sharing the same origin-scoped storage: writes race, last write wins,
/// and every mutation is broadcast tagged with the writer's context id.
pub struct MemorySubstrate {
    shared: Arc<OriginShared>,
    context: u64,
    access_denied: AtomicBool,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (changes_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(OriginShared {
                data: Mutex::new(BTreeMap::new()),
                capacity,
                changes_tx,
            }),
            context: next_context_id(),
            access_denied: AtomicBool::new(false),
        }
    }

    /// A new handle onto the same origin, as another tab would get.
    pub fn attach(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            context: next_context_id(),
            access_denied: AtomicBool::new(false),
        }
    }

    /// Deny all access through this handle, the way a privacy-mode host
    /// denies storage to one context.
    pub fn set_access_denied(&self, denied: bool) {
        self.access_denied.store(denied, Ordering::Relaxed);
    }

    fn check_access(&self) -> Result<(), SubstrateError> {
        if self.access_denied.load(Ordering::Relaxed) {
            return Err(SubstrateError::AccessDenied);
        }
        Ok(())
    }

    fn lock_data(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.shared.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // Ignore send errors (no active subscribers is fine)
        let _ = self.shared.changes_tx.send(SubstrateChange {
            context: self.context,
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl Substrate for MemorySubstrate {
    fn get(&self, key: &str) -> Result<Option<String>, SubstrateError> {
        self.check_access()?;
        Ok(self.lock_data().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SubstrateError> {
        self.check_access()?;
        let old = {
            let mut data = self.lock_data();
            let used: usize = data.iter().map(|(k, v)| k.len() + v.len()).sum();
            let existing = data.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let needed = used - existing + key.len() + value.len();
            if needed > self.shared.capacity {
                return Err(SubstrateError::QuotaExceeded {
                    needed,
                    capacity: self.shared.capacity,
                });
            }
            data.insert(key.to_string(), value.to_string())
        };
        self.broadcast(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<String>, SubstrateError> {
        self.check_access()?;
        let old = self.lock_data().remove(key);
        if old.is_some() {
            self.broadcast(key, old.clone(), None);
        }
        Ok(old)
    }

    fn keys(&self) -> Result<Vec<String>, SubstrateError> {
        self.check_access()?;
        Ok(self.lock_data().keys().cloned().collect())
    }

    fn used(&self) -> Result<usize, SubstrateError> {
        self.check_access()?;
        Ok(self.lock_data().iter().map(|(k, v)| k.len() + v.len()).sum())
    }

    fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn context_id(&self) -> u64 {
        self.context
    }

    fn changes(&self) -> broadcast::Receiver<SubstrateChange> {
        self.shared.changes_tx.subscribe()
    }
}
