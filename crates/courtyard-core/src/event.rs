// ABOUTME: Defines the change event delivered to listeners on every store mutation.
// ABOUTME: Events carry the logical key plus old/new values, or an error description.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of mutation (or failure) an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEventKind {
    SetItem,
    RemoveItem,
    Clear,
    Error,
}

impl StoreEventKind {
    /// Stable snake_case name, used in logs and harness output.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreEventKind::SetItem => "set_item",
            StoreEventKind::RemoveItem => "remove_item",
            StoreEventKind::Clear => "clear",
            StoreEventKind::Error => "error",
        }
    }
}

/// A change event fanned out to listeners after a mutation. For `clear`
/// there is no key; for `error` the mutation did not take effect and the
/// classified message rides along instead of a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: Option<String>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl StoreEvent {
    pub fn set_item(
        key: impl Into<String>,
        old_value: Option<serde_json::Value>,
        new_value: serde_json::Value,
    ) -> Self {
        Self {
            kind: StoreEventKind::SetItem,
            key: Some(key.into()),
            old_value,
            new_value: Some(new_value),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn remove_item(key: impl Into<String>, old_value: Option<serde_json::Value>) -> Self {
        Self {
            kind: StoreEventKind::RemoveItem,
            key: Some(key.into()),
            old_value,
            new_value: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn clear() -> Self {
        Self {
            kind: StoreEventKind::Clear,
            key: None,
            old_value: None,
            new_value: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(key: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: StoreEventKind::Error,
            key,
            old_value: None,
            new_value: None,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}
