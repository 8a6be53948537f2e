//! Append-only event store boundary.
//!
//! Defines the store contract the reservation protocol and tag-state caches
//! read from, plus an in-memory backend and a publishing adapter.

pub mod in_memory;
pub mod r#trait;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use dcbkit_core::{SortableUniqueId, Tag};
use dcbkit_events::{Event, EventBus};

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError};

/// Bound a store call by `limit`; an elapsed timer becomes `EventStoreError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, EventStoreError>
where
    F: Future<Output = Result<T, EventStoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| EventStoreError::Timeout(limit))?
}

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Ordering invariant: **publish happens only after append succeeds**. A
/// publish failure is reported, but the events stay stored; push consumers
/// recover them through catch-up reads.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

#[async_trait]
impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<Event>,
{
    async fn append(&self, events: Vec<Event>) -> Result<Vec<Event>, EventStoreError> {
        let committed = self.store.append(events).await?;

        for e in &committed {
            self.bus
                .publish(e.clone())
                .map_err(|err| EventStoreError::Publish(format!("{err:?}")))?;
        }

        Ok(committed)
    }

    async fn read_for_tag(
        &self,
        tag: &Tag,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.store.read_for_tag(tag, since).await
    }

    async fn read_all_since(
        &self,
        since: Option<&SortableUniqueId>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.store.read_all_since(since, limit).await
    }

    async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableUniqueId>, EventStoreError> {
        self.store.latest_for_tag(tag).await
    }
}
