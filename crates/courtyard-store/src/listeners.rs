// ABOUTME: Per-key plus global listener registry with panic-isolated synchronous fan-out.
// ABOUTME: A failing listener never aborts delivery to siblings nor the mutation that fired it.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use courtyard_core::StoreEvent;
use ulid::Ulid;

/// Registering under the empty key receives every event regardless of
/// which key changed.
pub const GLOBAL_LISTENER_KEY: &str = "";

/// Callback handle invoked synchronously for each event.
pub type EventCallback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Subscription table keyed by logical key (or the global key). Delivery
/// order within one key's set is unspecified; delivery to every registered
/// handle is attempted even if one of them panics.
pub struct ListenerRegistry {
    inner: RwLock<HashMap<String, HashMap<Ulid, EventCallback>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a callback for one logical key, or for every key via
    /// [`GLOBAL_LISTENER_KEY`]. Returns the handle used to unregister.
    pub fn add(&self, key: &str, callback: EventCallback) -> Ulid {
        let id = Ulid::new();
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string()).or_default().insert(id, callback);
        id
    }

    /// Unregister a callback. Returns false if the handle was not found.
    pub fn remove(&self, key: &str, id: Ulid) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = map.get_mut(key) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            map.remove(key);
        }
        removed
    }

    /// Total registered callbacks across all keys.
    pub fn count(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.values().map(|set| set.len()).sum()
    }

    /// Fan an event out: the specific key's set first, then the global set.
    ///
    /// Callbacks run outside the registry lock, so a listener may re-enter
    /// the store. A listener that always triggers another mutation on the
    /// key it watches will loop; callers own breaking such cycles.
    pub fn emit(&self, event: &StoreEvent) {
        let targets: Vec<EventCallback> = {
            let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let mut targets = Vec::new();
            if let Some(key) = event.key.as_deref()
                && let Some(set) = map.get(key)
            {
                targets.extend(set.values().cloned());
            }
            if let Some(set) = map.get(GLOBAL_LISTENER_KEY) {
                targets.extend(set.values().cloned());
            }
            targets
        };

        for callback in targets {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(
                    kind = event.kind.as_str(),
                    key = event.key.as_deref().unwrap_or(""),
                    "listener panicked during event delivery; continuing with remaining listeners"
                );
            }
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
