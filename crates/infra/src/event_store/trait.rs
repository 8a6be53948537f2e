use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use dcbkit_core::{EventId, SortableUniqueId, Tag};
use dcbkit_events::Event;

/// Event store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors. Only
/// `Unavailable` and `Timeout` are transient; callers may retry those.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventStoreError {
    /// The backend could not be reached or refused the call.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured limit.
    #[error("event store call timed out after {0:?}")]
    Timeout(Duration),

    /// An event id was reused for a different event.
    #[error("event {0} already stored with different content")]
    DuplicateEvent(EventId),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Event publication failed after a successful append.
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl EventStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Append-only log shared by every tag.
///
/// ## Guarantees
///
/// - Events are returned in `SortableUniqueId` order, globally and per tag.
/// - `append` is idempotent per event id: re-appending an already stored event
///   (same id, same content) succeeds without storing it twice; reusing an id
///   for different content is `DuplicateEvent`.
/// - A batch is stored atomically (all or nothing).
///
/// The store does **not** enforce per-tag concurrency; that is the job of the
/// reservation protocol in front of it.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch; returns the batch as stored.
    async fn append(&self, events: Vec<Event>) -> Result<Vec<Event>, EventStoreError>;

    /// Events carrying `tag` with an id strictly greater than `since`.
    async fn read_for_tag(
        &self,
        tag: &Tag,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, EventStoreError>;

    /// Catch-up read over the whole log, strictly after `since`.
    async fn read_all_since(
        &self,
        since: Option<&SortableUniqueId>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, EventStoreError>;

    /// Id of the newest event carrying `tag`.
    async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableUniqueId>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, events: Vec<Event>) -> Result<Vec<Event>, EventStoreError> {
        (**self).append(events).await
    }

    async fn read_for_tag(
        &self,
        tag: &Tag,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, EventStoreError> {
        (**self).read_for_tag(tag, since).await
    }

    async fn read_all_since(
        &self,
        since: Option<&SortableUniqueId>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, EventStoreError> {
        (**self).read_all_since(since, limit).await
    }

    async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableUniqueId>, EventStoreError> {
        (**self).latest_for_tag(tag).await
    }
}
