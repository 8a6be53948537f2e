//! Tag-state persistence behind the per-tag caches.

pub mod tag_state_store;

pub use tag_state_store::{InMemoryTagStateStore, TagStateStore};
