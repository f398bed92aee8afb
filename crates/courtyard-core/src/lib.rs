// ABOUTME: Core library for courtyard persistence, containing the storage envelope,
// ABOUTME: change events, the public error taxonomy, and key namespacing.

pub mod envelope;
pub mod error;
pub mod event;
pub mod namespace;

pub use envelope::{CodecError, StorageEnvelope};
pub use error::StoreError;
pub use event::{StoreEvent, StoreEventKind};
pub use namespace::{DEFAULT_PREFIX, Namespacer};
