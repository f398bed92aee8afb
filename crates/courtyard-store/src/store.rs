// ABOUTME: The public store facade: versioned, expiring, change-notifying key-value operations.
// ABOUTME: Composes the namespacer, envelope codec, expiry policy, listener registry, and bridge.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use courtyard_core::{DEFAULT_PREFIX, Namespacer, StorageEnvelope, StoreError, StoreEvent};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::bridge::CrossTabBridge;
use crate::expiry::{self, SetOptions};
use crate::listeners::ListenerRegistry;
use crate::substrate::{DEFAULT_CAPACITY_BYTES, Substrate, SubstrateError};

/// Store construction parameters. The capacity here is the figure reported
/// by `stats` and the basis for the eviction watermark; the substrate
/// enforces its own ceiling independently.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub prefix: String,
    /// Build-wide envelope version tag.
    pub version: String,
    pub capacity_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
        }
    }
}

/// Usage summary over every namespaced entry present, live or stale.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// The configured capacity constant, not a live host query.
    pub total_size: usize,
    pub used_size: usize,
    pub item_count: usize,
    pub oldest_item: Option<DateTime<Utc>>,
    pub newest_item: Option<DateTime<Utc>>,
}

/// The public operation set, async-shaped so a backing engine with real
/// I/O latency can replace [`LocalStore`] without changing call sites.
/// Every current implementation completes synchronously within the turn.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_item(&self, key: &str, value: Value, options: SetOptions)
    -> Result<(), StoreError>;
    async fn get_item(&self, key: &str) -> Option<Value>;
    async fn remove_item(&self, key: &str) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    /// Presence only; expiry is NOT evaluated. A key may be present here
    /// and still come back `None` from `get_item` — this is not a
    /// liveness guarantee.
    async fn has_key(&self, key: &str) -> bool;
    async fn keys(&self) -> Vec<String>;
    async fn stats(&self) -> StoreStats;
    async fn export_data(&self) -> BTreeMap<String, Value>;
    async fn import_data(&self, data: BTreeMap<String, Value>, merge: bool)
    -> Result<(), StoreError>;
    fn add_listener(
        &self,
        key: &str,
        callback: Box<dyn Fn(&StoreEvent) + Send + Sync>,
    ) -> Ulid;
    fn remove_listener(&self, key: &str, id: Ulid) -> bool;
}

/// The store facade over a synchronous host substrate. Explicitly
/// constructed and passed by reference; lifecycle (`init`/`dispose`) is
/// owned by the process bootstrap, never by implicit first use.
pub struct LocalStore {
    substrate: Arc<dyn Substrate>,
    namespacer: Namespacer,
    listeners: Arc<ListenerRegistry>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences so operations on one store
    /// instance are totally ordered. Released before listener fan-out.
    op_lock: Mutex<()>,
    version_mismatches: AtomicU64,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl LocalStore {
    pub fn new(substrate: Arc<dyn Substrate>, config: StoreConfig) -> Self {
        Self {
            substrate,
            namespacer: Namespacer::new(config.prefix.clone()),
            listeners: Arc::new(ListenerRegistry::new()),
            config,
            op_lock: Mutex::new(()),
            version_mismatches: AtomicU64::new(0),
            bridge: Mutex::new(None),
        }
    }

    /// Start the cross-tab bridge. Idempotent; must run within a tokio
    /// runtime.
    pub fn init(&self) {
        let mut bridge = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
        if bridge.is_none() {
            *bridge = Some(CrossTabBridge::spawn(
                Arc::clone(&self.substrate),
                self.namespacer.clone(),
                Arc::clone(&self.listeners),
            ));
        }
    }

    /// Stop the cross-tab bridge. Idempotent.
    pub fn dispose(&self) {
        if let Some(handle) = self
            .bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Write a value under the given key. On success a `set_item` event is
    /// emitted; on failure the prior value is left untouched and an
    /// `error` event precedes the returned error. All-or-nothing at
    /// single-key granularity.
    pub async fn set_item<V: Serialize>(
        &self,
        key: &str,
        value: V,
        options: SetOptions,
    ) -> Result<(), StoreError> {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                let err = StoreError::invalid_data(
                    format!("failed to serialize value for '{key}'"),
                    Some(Box::new(e)),
                );
                self.listeners
                    .emit(&StoreEvent::error(Some(key.to_string()), err.to_string()));
                return Err(err);
            }
        };

        let (result, evictions) = self.write_envelope(key, &value, &options);
        for event in &evictions {
            self.listeners.emit(event);
        }
        match result {
            Ok(old_value) => {
                self.listeners
                    .emit(&StoreEvent::set_item(key, old_value, value));
                Ok(())
            }
            Err(err) => {
                self.listeners
                    .emit(&StoreEvent::error(Some(key.to_string()), err.to_string()));
                Err(err)
            }
        }
    }

    /// Read a value. Missing keys and stale entries return `None`; a stale
    /// entry is evicted on the spot and reported as a `remove_item` event.
    /// Corrupt entries log and return `None` — the read path never fails.
    pub async fn get_item(&self, key: &str) -> Option<Value> {
        let (result, event) = {
            let _guard = self.op_guard();
            let physical = self.namespacer.namespaced(key);
            let raw = match self.substrate.get(&physical) {
                Ok(Some(raw)) => raw,
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(key, error = %e, "read failed; treating key as absent");
                    return None;
                }
            };

            match StorageEnvelope::<Value>::decode(&raw) {
                Err(e) => {
                    tracing::warn!(key, error = %e, "corrupt entry; treating key as absent");
                    (None, None)
                }
                Ok(envelope) => {
                    if expiry::is_stale(&envelope, Utc::now()) {
                        if let Err(e) = self.substrate.remove(&physical) {
                            tracing::warn!(key, error = %e, "failed to evict stale entry");
                        }
                        (None, Some(StoreEvent::remove_item(key, Some(envelope.value))))
                    } else {
                        if envelope.version != self.config.version {
                            self.version_mismatches.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                key,
                                stored = %envelope.version,
                                current = %self.config.version,
                                "envelope version mismatch; returning value unmigrated"
                            );
                        }
                        (Some(envelope.value), None)
                    }
                }
            }
        };

        if let Some(event) = event {
            self.listeners.emit(&event);
        }
        result
    }

    /// Read and deserialize into a concrete type. A stored value that does
    /// not match the requested shape logs and returns `None`.
    pub async fn get_item_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_item(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::warn!(key, error = %e, "stored value does not deserialize to requested type");
                None
            }
        }
    }

    /// Remove a key. Removing a non-existent key is a no-op that still
    /// emits a `remove_item` event with an absent old value.
    pub async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let removed = {
            let _guard = self.op_guard();
            let physical = self.namespacer.namespaced(key);
            self.substrate.remove(&physical)
        };

        match removed {
            Ok(old_raw) => {
                let old_value = old_raw
                    .as_deref()
                    .and_then(|raw| StorageEnvelope::<Value>::decode(raw).ok())
                    .map(|envelope| envelope.value);
                self.listeners.emit(&StoreEvent::remove_item(key, old_value));
                Ok(())
            }
            Err(e) => {
                let err: StoreError = e.into();
                self.listeners
                    .emit(&StoreEvent::error(Some(key.to_string()), err.to_string()));
                Err(err)
            }
        }
    }

    /// Remove every namespaced entry, leaving other applications' keys in
    /// the shared substrate untouched. Emits one `clear` event.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let result = {
            let _guard = self.op_guard();
            self.substrate.keys().and_then(|keys| {
                for physical in keys.iter().filter(|k| self.namespacer.owns(k)) {
                    self.substrate.remove(physical)?;
                }
                Ok(())
            })
        };

        match result {
            Ok(()) => {
                self.listeners.emit(&StoreEvent::clear());
                Ok(())
            }
            Err(e) => {
                let err: StoreError = e.into();
                self.listeners.emit(&StoreEvent::error(None, err.to_string()));
                Err(err)
            }
        }
    }

    /// Presence check only. Expiry is NOT evaluated here; see the trait
    /// docs for the divergence from `get_item`.
    pub async fn has_key(&self, key: &str) -> bool {
        let physical = self.namespacer.namespaced(key);
        match self.substrate.get(&physical) {
            Ok(value) => value.is_some(),
            Err(e) => {
                tracing::warn!(key, error = %e, "presence check failed; reporting absent");
                false
            }
        }
    }

    /// Logical keys currently present, stale-but-unread ones included.
    pub async fn keys(&self) -> Vec<String> {
        match self.substrate.keys() {
            Ok(all) => all
                .iter()
                .filter_map(|physical| self.namespacer.strip(physical))
                .map(String::from)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "key enumeration failed; reporting empty");
                Vec::new()
            }
        }
    }

    /// Usage summary. Unparsable entries count toward size and item count
    /// but are skipped for the timestamp extrema.
    pub async fn stats(&self) -> StoreStats {
        let _guard = self.op_guard();
        let mut stats = StoreStats {
            total_size: self.config.capacity_bytes,
            used_size: 0,
            item_count: 0,
            oldest_item: None,
            newest_item: None,
        };

        let keys = match self.substrate.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "stats enumeration failed");
                return stats;
            }
        };

        for physical in keys {
            if !self.namespacer.owns(&physical) {
                continue;
            }
            let Ok(Some(raw)) = self.substrate.get(&physical) else {
                continue;
            };
            stats.used_size += physical.len() + raw.len();
            stats.item_count += 1;
            if let Ok(envelope) = StorageEnvelope::<Value>::decode(&raw) {
                stats.oldest_item =
                    Some(stats.oldest_item.map_or(envelope.timestamp, |t| t.min(envelope.timestamp)));
                stats.newest_item =
                    Some(stats.newest_item.map_or(envelope.timestamp, |t| t.max(envelope.timestamp)));
            }
        }

        stats
    }

    pub async fn set_item_with_expiry<V: Serialize>(
        &self,
        key: &str,
        value: V,
        expires_in: Duration,
    ) -> Result<(), StoreError> {
        self.set_item(key, value, SetOptions::expires_in(expires_in))
            .await
    }

    pub async fn set_item_for_hour<V: Serialize>(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.set_item_with_expiry(key, value, Duration::hours(1)).await
    }

    pub async fn set_item_for_day<V: Serialize>(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.set_item_with_expiry(key, value, Duration::hours(24)).await
    }

    pub async fn set_item_for_week<V: Serialize>(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.set_item_with_expiry(key, value, Duration::days(7)).await
    }

    pub async fn set_item_for_month<V: Serialize>(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.set_item_with_expiry(key, value, Duration::days(30)).await
    }

    /// Live values only: the export goes through the read path, so stale
    /// entries are excluded (and evicted as a side effect).
    pub async fn export_data(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for key in self.keys().await {
            if let Some(value) = self.get_item(&key).await {
                out.insert(key, value);
            }
        }
        out
    }

    /// Best-effort batch write; individual failures are logged and skipped,
    /// never aborting the rest of the batch. `merge == false` clears first.
    pub async fn import_data(
        &self,
        data: BTreeMap<String, Value>,
        merge: bool,
    ) -> Result<(), StoreError> {
        if !merge {
            self.clear().await?;
        }
        for (key, value) in data {
            if let Err(e) = self.set_item(&key, value, SetOptions::default()).await {
                tracing::warn!(key, error = %e, "import: skipping entry that failed to write");
            }
        }
        Ok(())
    }

    /// Register a callback for one logical key, or for every key via the
    /// empty string. Callbacks run synchronously during mutations; one that
    /// always mutates the key it watches will loop unboundedly.
    pub fn add_listener<F>(&self, key: &str, callback: F) -> Ulid
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.listeners.add(key, Arc::new(callback))
    }

    pub fn remove_listener(&self, key: &str, id: Ulid) -> bool {
        self.listeners.remove(key, id)
    }

    /// How many reads returned a value whose envelope version differed
    /// from the running tag. Mismatches are logged, counted, and otherwise
    /// ignored; no migration is performed.
    pub fn version_mismatch_count(&self) -> u64 {
        self.version_mismatches.load(Ordering::Relaxed)
    }

    fn op_guard(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Usage level above which a write first sweeps expired entries.
    fn watermark(&self) -> usize {
        self.config.capacity_bytes / 10 * 9
    }

    /// Encode and write one envelope under the op lock. Returns the prior
    /// logical value and any eviction events the caller must emit after
    /// the lock is released.
    fn write_envelope(
        &self,
        key: &str,
        value: &Value,
        options: &SetOptions,
    ) -> (Result<Option<Value>, StoreError>, Vec<StoreEvent>) {
        let mut evictions = Vec::new();
        let _guard = self.op_guard();

        let physical = self.namespacer.namespaced(key);
        let now = Utc::now();
        let expires_at = options.expires_in.map(|d| now + d);
        let envelope =
            StorageEnvelope::wrap(key, value.clone(), self.config.version.clone(), expires_at);
        let raw = match envelope.encode() {
            Ok(raw) => raw,
            Err(e) => {
                let err = StoreError::invalid_data(
                    format!("failed to serialize envelope for '{key}'"),
                    Some(Box::new(e)),
                );
                return (Err(err), evictions);
            }
        };

        let old_value = match self.substrate.get(&physical) {
            Ok(Some(prev)) => StorageEnvelope::<Value>::decode(&prev)
                .ok()
                .map(|envelope| envelope.value),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(key, error = %e, "could not read prior value before write");
                None
            }
        };

        let mut swept = false;
        if let Ok(used) = self.substrate.used() {
            if used + physical.len() + raw.len() > self.watermark() {
                evictions.extend(self.sweep_expired());
                swept = true;
            }
        }

        let result = match self.substrate.set(&physical, &raw) {
            Ok(()) => Ok(old_value),
            Err(SubstrateError::QuotaExceeded { .. }) if !swept => {
                evictions.extend(self.sweep_expired());
                self.substrate
                    .set(&physical, &raw)
                    .map(|_| old_value)
                    .map_err(StoreError::from)
            }
            Err(e) => Err(e.into()),
        };
        (result, evictions)
    }

    /// Remove every expired namespaced entry, collecting the removal
    /// events. Called with the op lock held; best-effort throughout.
    fn sweep_expired(&self) -> Vec<StoreEvent> {
        let now = Utc::now();
        let keys = match self.substrate.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "expired sweep could not enumerate keys");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for physical in keys {
            let Some(logical) = self.namespacer.strip(&physical) else {
                continue;
            };
            let Ok(Some(raw)) = self.substrate.get(&physical) else {
                continue;
            };
            let Ok(envelope) = StorageEnvelope::<Value>::decode(&raw) else {
                continue;
            };
            if expiry::is_stale(&envelope, now) {
                match self.substrate.remove(&physical) {
                    Ok(_) => events.push(StoreEvent::remove_item(logical, Some(envelope.value))),
                    Err(e) => tracing::warn!(key = logical, error = %e, "failed to evict expired entry"),
                }
            }
        }

        if !events.is_empty() {
            tracing::info!(evicted = events.len(), "swept expired entries under capacity pressure");
        }
        events
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    async fn set_item(&self, key: &str, value: Value, options: SetOptions)
    -> Result<(), StoreError> {
        LocalStore::set_item(self, key, value, options).await
    }

    async fn get_item(&self, key: &str) -> Option<Value> {
        LocalStore::get_item(self, key).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        LocalStore::remove_item(self, key).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        LocalStore::clear(self).await
    }

    async fn has_key(&self, key: &str) -> bool {
        LocalStore::has_key(self, key).await
    }

    async fn keys(&self) -> Vec<String> {
        LocalStore::keys(self).await
    }

    async fn stats(&self) -> StoreStats {
        LocalStore::stats(self).await
    }

    async fn export_data(&self) -> BTreeMap<String, Value> {
        LocalStore::export_data(self).await
    }

    async fn import_data(&self, data: BTreeMap<String, Value>, merge: bool)
    -> Result<(), StoreError> {
        LocalStore::import_data(self, data, merge).await
    }

    fn add_listener(
        &self,
        key: &str,
        callback: Box<dyn Fn(&StoreEvent) + Send + Sync>,
    ) -> Ulid {
        LocalStore::add_listener(self, key, callback)
    }

    fn remove_listener(&self, key: &str, id: Ulid) -> bool {
        LocalStore::remove_listener(self, key, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;
    use courtyard_core::StoreEventKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn store_with_capacity(capacity: usize) -> (Arc<MemorySubstrate>, LocalStore) {
        let substrate = Arc::new(MemorySubstrate::with_capacity(capacity));
        let config = StoreConfig {
            capacity_bytes: capacity,
            ..StoreConfig::default()
        };
        let store = LocalStore::new(Arc::clone(&substrate) as Arc<dyn Substrate>, config);
        (substrate, store)
    }

    fn default_store() -> (Arc<MemorySubstrate>, LocalStore) {
        store_with_capacity(DEFAULT_CAPACITY_BYTES)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (_sub, store) = default_store();
        store
            .set_item("cfg", json!({"a": 1}), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(store.get_item("cfg").await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (_sub, store) = default_store();
        assert_eq!(store.get_item("nothing").await, None);
    }

    #[tokio::test]
    async fn remove_then_get_returns_none() {
        let (_sub, store) = default_store();
        store
            .set_item("cfg", json!({"a": 1}), SetOptions::default())
            .await
            .unwrap();
        store.remove_item("cfg").await.unwrap();
        assert_eq!(store.get_item("cfg").await, None);
    }

    #[tokio::test]
    async fn typed_read_round_trips() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct ParkingSpot {
            number: u32,
            reserved: bool,
        }

        let (_sub, store) = default_store();
        let spot = ParkingSpot {
            number: 17,
            reserved: true,
        };
        store.set_item("spot", &spot, SetOptions::default()).await.unwrap();
        assert_eq!(store.get_item_as::<ParkingSpot>("spot").await, Some(spot));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_none_and_is_evicted() {
        let (_sub, store) = default_store();
        store
            .set_item_with_expiry("tmp", "x", Duration::milliseconds(-1))
            .await
            .unwrap();

        // Present but stale: has_key ignores expiry
        assert!(store.has_key("tmp").await);

        assert_eq!(store.get_item("tmp").await, None);

        // The stale read evicted the entry
        assert!(!store.has_key("tmp").await);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn zero_duration_expires_immediately() {
        let (_sub, store) = default_store();
        store
            .set_item_with_expiry("tmp", "x", Duration::zero())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.get_item("tmp").await, None);
    }

    #[tokio::test]
    async fn entry_is_live_before_its_deadline() {
        let (_sub, store) = default_store();
        store
            .set_item_with_expiry("session", json!("token"), Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(store.get_item("session").await, Some(json!("token")));
    }

    #[tokio::test]
    async fn expiry_elapses_in_real_time() {
        let (_sub, store) = default_store();
        store
            .set_item_with_expiry("blip", "x", Duration::milliseconds(100))
            .await
            .unwrap();
        assert_eq!(store.get_item("blip").await, Some(json!("x")));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(store.get_item("blip").await, None);
    }

    #[tokio::test]
    async fn stale_read_emits_remove_item_event() {
        let (_sub, store) = default_store();
        let events: Arc<Mutex<Vec<StoreEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.add_listener("tmp", move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        store
            .set_item_with_expiry("tmp", "x", Duration::milliseconds(-1))
            .await
            .unwrap();
        store.get_item("tmp").await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, StoreEventKind::SetItem);
        assert_eq!(events[1].kind, StoreEventKind::RemoveItem);
        assert_eq!(events[1].old_value, Some(json!("x")));
    }

    #[tokio::test]
    async fn clear_spares_foreign_keys() {
        let (substrate, store) = default_store();
        substrate.set("other-app:data", "theirs").unwrap();
        store.set_item("mine", json!(1), SetOptions::default()).await.unwrap();

        store.clear().await.unwrap();

        assert!(store.keys().await.is_empty());
        assert_eq!(
            substrate.get("other-app:data").unwrap().as_deref(),
            Some("theirs")
        );
    }

    #[tokio::test]
    async fn removing_missing_key_still_notifies() {
        let (_sub, store) = default_store();
        let events: Arc<Mutex<Vec<StoreEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.add_listener("ghost", move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        store.remove_item("ghost").await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, StoreEventKind::RemoveItem);
        assert_eq!(events[0].old_value, None);
    }

    #[tokio::test]
    async fn stats_track_item_count_and_extrema() {
        let (_sub, store) = default_store();
        let empty = store.stats().await;
        assert_eq!(empty.item_count, 0);
        assert!(empty.oldest_item.is_none());

        store.set_item("a", json!(1), SetOptions::default()).await.unwrap();
        let one = store.stats().await;
        assert_eq!(one.item_count, 1);
        assert_eq!(one.total_size, DEFAULT_CAPACITY_BYTES);
        assert!(one.used_size > 0);

        store.set_item("b", json!(2), SetOptions::default()).await.unwrap();
        let two = store.stats().await;
        assert_eq!(two.item_count, 2);
        assert!(two.used_size > one.used_size);
        assert!(two.oldest_item.unwrap() <= two.newest_item.unwrap());

        store.remove_item("a").await.unwrap();
        assert_eq!(store.stats().await.item_count, 1);
    }

    #[tokio::test]
    async fn stats_skip_unparsable_entries_for_extrema() {
        let (substrate, store) = default_store();
        store.set_item("good", json!(1), SetOptions::default()).await.unwrap();
        substrate.set("courtyard:junk", "not an envelope").unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.item_count, 2, "junk still occupies space");
        assert_eq!(
            stats.oldest_item, stats.newest_item,
            "only the parseable entry feeds the extrema"
        );
    }

    #[tokio::test]
    async fn listeners_fire_specific_then_global() {
        let (_sub, store) = default_store();
        let specific = Arc::new(AtomicUsize::new(0));
        let global = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&specific);
        store.add_listener("watched", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&global);
        store.add_listener("", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_item("watched", json!(1), SetOptions::default()).await.unwrap();
        store.set_item("other", json!(2), SetOptions::default()).await.unwrap();

        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(global.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_event_carries_old_and_new_values() {
        let (_sub, store) = default_store();
        let events: Arc<Mutex<Vec<StoreEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.add_listener("k", move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        store.set_item("k", json!(1), SetOptions::default()).await.unwrap();
        store.set_item("k", json!(2), SetOptions::default()).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events[0].old_value, None);
        assert_eq!(events[0].new_value, Some(json!(1)));
        assert_eq!(events[1].old_value, Some(json!(1)));
        assert_eq!(events[1].new_value, Some(json!(2)));
    }

    #[tokio::test]
    async fn panicking_listener_neither_blocks_siblings_nor_fails_the_write() {
        let (_sub, store) = default_store();
        let hits = Arc::new(AtomicUsize::new(0));

        store.add_listener("k", |_| panic!("bad listener"));
        let counter = Arc::clone(&hits);
        store.add_listener("k", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_item("k", json!("survives"), SetOptions::default()).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_item("k").await, Some(json!("survives")));
    }

    #[tokio::test]
    async fn quota_failure_surfaces_and_emits_error_event() {
        let (_sub, store) = store_with_capacity(150);
        let events: Arc<Mutex<Vec<StoreEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.add_listener("", move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let result = store
            .set_item("big", "x".repeat(400), SetOptions::default())
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert_eq!(store.get_item("big").await, None, "nothing was written");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, StoreEventKind::Error);
        assert!(events[0].error.as_deref().unwrap().contains("quota"));
    }

    #[tokio::test]
    async fn storage_disabled_classifies_on_write() {
        let (substrate, store) = default_store();
        substrate.set_access_denied(true);

        let err = store
            .set_item("k", json!(1), SetOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_DISABLED");

        assert_eq!(store.get_item("k").await, None, "reads degrade to absent");
    }

    #[tokio::test]
    async fn capacity_pressure_sweeps_expired_entries() {
        let (substrate, store) = store_with_capacity(2_000);

        // Pre-existing expired filler, written beneath the facade
        for i in 0..3 {
            let raw = StorageEnvelope::wrap(
                format!("stale-{i}"),
                json!("x".repeat(500)),
                "0.1.0",
                Some(Utc::now() - Duration::hours(1)),
            )
            .encode()
            .unwrap();
            substrate.set(&format!("courtyard:stale-{i}"), &raw).unwrap();
        }
        assert_eq!(store.keys().await.len(), 3);

        // Projected usage is past the watermark, so the write sweeps the
        // expired filler instead of failing.
        store
            .set_item("fresh", json!("fits"), SetOptions::default())
            .await
            .unwrap();

        let keys = store.keys().await;
        assert_eq!(keys, vec!["fresh".to_string()]);
        assert_eq!(store.get_item("fresh").await, Some(json!("fits")));
    }

    #[tokio::test]
    async fn version_mismatch_is_counted_not_fatal() {
        let substrate = Arc::new(MemorySubstrate::new());
        let writer = LocalStore::new(
            Arc::clone(&substrate) as Arc<dyn Substrate>,
            StoreConfig {
                version: "0.0.9".to_string(),
                ..StoreConfig::default()
            },
        );
        let reader = LocalStore::new(Arc::clone(&substrate) as Arc<dyn Substrate>, StoreConfig::default());

        writer.set_item("cfg", json!(1), SetOptions::default()).await.unwrap();

        assert_eq!(reader.get_item("cfg").await, Some(json!(1)));
        assert_eq!(reader.version_mismatch_count(), 1);
        assert_eq!(writer.version_mismatch_count(), 0);
    }

    #[tokio::test]
    async fn export_excludes_stale_and_import_round_trips() {
        let (_sub, store) = default_store();
        store.set_item("a", json!(1), SetOptions::default()).await.unwrap();
        store.set_item("b", json!({"x": true}), SetOptions::default()).await.unwrap();
        store
            .set_item_with_expiry("stale", "gone", Duration::milliseconds(-1))
            .await
            .unwrap();

        let exported = store.export_data().await;
        assert_eq!(exported.len(), 2);
        assert!(!exported.contains_key("stale"));

        store.import_data(exported.clone(), false).await.unwrap();
        let again = store.export_data().await;
        assert_eq!(again, exported);
    }

    #[tokio::test]
    async fn import_with_merge_false_replaces_existing_data() {
        let (_sub, store) = default_store();
        store.set_item("old", json!("out"), SetOptions::default()).await.unwrap();

        let mut incoming = BTreeMap::new();
        incoming.insert("new".to_string(), json!("in"));
        store.import_data(incoming, false).await.unwrap();

        assert_eq!(store.keys().await, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn import_continues_past_entries_that_fail() {
        let (_sub, store) = store_with_capacity(300);

        let mut incoming = BTreeMap::new();
        incoming.insert("fits".to_string(), json!("small"));
        incoming.insert("too-big".to_string(), json!("y".repeat(600)));

        store.import_data(incoming, true).await.unwrap();

        assert_eq!(store.get_item("fits").await, Some(json!("small")));
        assert_eq!(store.get_item("too-big").await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reentrant_listener_can_write_another_key() {
        let (_sub, store) = default_store();
        let store = Arc::new(store);

        let inner = Arc::clone(&store);
        store.add_listener("trigger", move |_| {
            let store = Arc::clone(&inner);
            tokio::spawn(async move {
                let _ = store.set_item("echo", json!("reentered"), SetOptions::default()).await;
            });
        });

        store.set_item("trigger", json!(1), SetOptions::default()).await.unwrap();

        for _ in 0..100 {
            if store.get_item("echo").await.is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("re-entrant write never landed");
    }

    #[tokio::test]
    async fn cross_tab_change_reaches_sibling_store_listeners() {
        let substrate_a = Arc::new(MemorySubstrate::new());
        let substrate_b = Arc::new(substrate_a.attach());

        let store_a = LocalStore::new(substrate_a as Arc<dyn Substrate>, StoreConfig::default());
        let store_b = LocalStore::new(substrate_b as Arc<dyn Substrate>, StoreConfig::default());
        store_b.init();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        store_b.add_listener("shared", move |event| {
            let _ = tx.send(event.clone());
        });

        store_a
            .set_item("shared", json!({"from": "tab a"}), SetOptions::default())
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("bridge delivered nothing within a second")
            .expect("channel closed");
        assert_eq!(event.kind, StoreEventKind::SetItem);
        assert_eq!(event.key.as_deref(), Some("shared"));
        assert_eq!(event.new_value, Some(json!({"from": "tab a"})));

        store_b.dispose();
    }

    #[tokio::test]
    async fn own_writes_do_not_loop_back_through_the_bridge() {
        let substrate = Arc::new(MemorySubstrate::new());
        let store = LocalStore::new(substrate as Arc<dyn Substrate>, StoreConfig::default());
        store.init();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        store.add_listener("k", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_item("k", json!(1), SetOptions::default()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Exactly one delivery: the local emit, not a bridged duplicate
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        store.dispose();
    }

    #[tokio::test]
    async fn init_and_dispose_are_idempotent() {
        let (_sub, store) = default_store();
        store.init();
        store.init();
        store.dispose();
        store.dispose();
    }
}
