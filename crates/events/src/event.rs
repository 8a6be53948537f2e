use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use dcbkit_core::{DomainResult, EventId, SortableUniqueId, Tag};

/// A typed event body.
///
/// Payloads are:
/// - **immutable** (treat them as facts)
/// - **serializable** (stored as JSON next to their type name)
pub trait EventPayload: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event type identifier (e.g. "StudentEnrolled").
    fn event_type(&self) -> &'static str;
}

/// A committed (or about-to-be-committed) event in the shared log.
///
/// `sortable_id` orders the event globally; `tags` name every boundary the
/// event belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub sortable_id: SortableUniqueId,
    pub event_type: String,
    pub tags: Vec<Tag>,
    pub payload: JsonValue,
}

impl Event {
    pub fn new(
        sortable_id: SortableUniqueId,
        event_type: impl Into<String>,
        tags: Vec<Tag>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: EventId::new(),
            sortable_id,
            event_type: event_type.into(),
            tags,
            payload,
        }
    }

    /// Encode a typed payload.
    pub fn from_payload<E: EventPayload>(
        sortable_id: SortableUniqueId,
        payload: &E,
        tags: Vec<Tag>,
    ) -> DomainResult<Self> {
        Ok(Self::new(
            sortable_id,
            payload.event_type(),
            tags,
            serde_json::to_value(payload)?,
        ))
    }

    /// Decode the payload as `E`.
    pub fn decode<E: DeserializeOwned>(&self) -> DomainResult<E> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Tags that require write reservations.
    pub fn consistency_tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter().filter(|t| t.is_consistency())
    }
}
