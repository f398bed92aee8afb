// ABOUTME: The courtyard persistence layer: substrate implementations, expiry policy,
// ABOUTME: listener registry, cross-tab bridge, and the public store facade.

pub mod bridge;
pub mod expiry;
pub mod listeners;
pub mod store;
pub mod substrate;

pub use expiry::SetOptions;
pub use listeners::{GLOBAL_LISTENER_KEY, ListenerRegistry};
pub use store::{KeyValueStore, LocalStore, StoreConfig, StoreStats};
pub use substrate::{
    DEFAULT_CAPACITY_BYTES, MemorySubstrate, SqliteSubstrate, Substrate, SubstrateChange,
    SubstrateError,
};
