// ABOUTME: Re-enters the listener pipeline for substrate changes made by other execution contexts.
// ABOUTME: Filters out this context's own writes and every key outside the application prefix.

use std::sync::Arc;

use courtyard_core::{Namespacer, StorageEnvelope, StoreEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::listeners::ListenerRegistry;
use crate::substrate::{Substrate, SubstrateChange};

/// Background task that watches the origin's change broadcast and replays
/// foreign mutations through the local listener registry, the way a tab
/// reacts to storage events raised by its siblings.
pub struct CrossTabBridge;

impl CrossTabBridge {
    /// Spawn the bridge task. Must be called within a tokio runtime; the
    /// returned handle is aborted by the store's `dispose`.
    pub fn spawn(
        substrate: Arc<dyn Substrate>,
        namespacer: Namespacer,
        listeners: Arc<ListenerRegistry>,
    ) -> JoinHandle<()> {
        let own_context = substrate.context_id();
        let mut rx = substrate.changes();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => deliver(&change, own_context, &namespacer, &listeners),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "cross-tab bridge lagged; changes dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Classify one foreign change and fan it out. Changes from this context
/// and keys belonging to other applications are ignored entirely.
fn deliver(
    change: &SubstrateChange,
    own_context: u64,
    namespacer: &Namespacer,
    listeners: &ListenerRegistry,
) {
    if change.context == own_context {
        return;
    }
    let Some(logical) = namespacer.strip(&change.key) else {
        return;
    };

    let old_value = change.old_value.as_deref().and_then(envelope_value);
    let event = match change.new_value.as_deref() {
        Some(raw) => StoreEvent::set_item(
            logical,
            old_value,
            envelope_value(raw).unwrap_or(serde_json::Value::Null),
        ),
        None => StoreEvent::remove_item(logical, old_value),
    };

    tracing::debug!(
        kind = event.kind.as_str(),
        key = logical,
        context = change.context,
        "replaying foreign storage change"
    );
    listeners.emit(&event);
}

/// Recover the logical value from raw envelope text. Foreign contexts only
/// ever write envelopes, but a value that fails to parse surfaces as None
/// rather than aborting delivery.
fn envelope_value(raw: &str) -> Option<serde_json::Value> {
    StorageEnvelope::<serde_json::Value>::decode(raw)
        .ok()
        .map(|envelope| envelope.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn change(context: u64, key: &str, new_value: Option<&str>) -> SubstrateChange {
        SubstrateChange {
            context,
            key: key.to_string(),
            old_value: None,
            new_value: new_value.map(String::from),
        }
    }

    fn raw_envelope(key: &str, value: serde_json::Value) -> String {
        StorageEnvelope::wrap(key, value, "0.1.0", None)
            .encode()
            .unwrap()
    }

    #[test]
    fn own_context_changes_are_ignored() {
        let listeners = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        listeners.add("k", Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let raw = raw_envelope("k", serde_json::json!(1));
        deliver(
            &change(7, "courtyard:k", Some(&raw)),
            7,
            &Namespacer::default(),
            &listeners,
        );

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn foreign_prefix_changes_are_ignored() {
        let listeners = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        listeners.add(crate::listeners::GLOBAL_LISTENER_KEY, Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        deliver(
            &change(2, "other-app:k", Some("whatever")),
            1,
            &Namespacer::default(),
            &listeners,
        );

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn foreign_set_replays_with_logical_key_and_value() {
        let listeners = ListenerRegistry::new();
        let seen: Arc<std::sync::Mutex<Vec<StoreEvent>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners.add("fees", Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        let raw = raw_envelope("fees", serde_json::json!({"rate": 12}));
        deliver(
            &change(2, "courtyard:fees", Some(&raw)),
            1,
            &Namespacer::default(),
            &listeners,
        );

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key.as_deref(), Some("fees"));
        assert_eq!(events[0].new_value, Some(serde_json::json!({"rate": 12})));
    }

    #[test]
    fn foreign_removal_replays_as_remove_item() {
        let listeners = ListenerRegistry::new();
        let seen: Arc<std::sync::Mutex<Vec<StoreEvent>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners.add("gone", Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        let mut removal = change(2, "courtyard:gone", None);
        removal.old_value = Some(raw_envelope("gone", serde_json::json!("bye")));
        deliver(&removal, 1, &Namespacer::default(), &listeners);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            courtyard_core::StoreEventKind::RemoveItem
        );
        assert_eq!(events[0].old_value, Some(serde_json::json!("bye")));
    }

    #[test]
    fn unparsable_foreign_value_degrades_to_null() {
        let listeners = ListenerRegistry::new();
        let seen: Arc<std::sync::Mutex<Vec<StoreEvent>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listeners.add("junk", Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        deliver(
            &change(2, "courtyard:junk", Some("not an envelope")),
            1,
            &Namespacer::default(),
            &listeners,
        );

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_value, Some(serde_json::Value::Null));
    }
}
