//! Materialized tag states.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use dcbkit_core::{DomainError, DomainResult, SortableUniqueId, TagStateId};

use crate::{Event, TagProjector};

/// Type-erased projector state.
///
/// Caches, registries and snapshots hold states of many projectors side by side;
/// the typed value is recovered with [`TagStatePayload::decode`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagStatePayload {
    /// Nothing has been folded yet.
    #[default]
    Empty,
    State { type_name: String, data: JsonValue },
}

impl TagStatePayload {
    pub fn from_state<P: TagProjector>(state: &P::State) -> DomainResult<Self> {
        Ok(Self::State {
            type_name: short_type_name::<P::State>().to_string(),
            data: serde_json::to_value(state)?,
        })
    }

    /// Decode as the projector's state; `Empty` decodes to the default state.
    pub fn decode<P: TagProjector>(&self) -> DomainResult<P::State> {
        match self {
            Self::Empty => Ok(P::State::default()),
            Self::State { data, .. } => Ok(serde_json::from_value(data.clone())?),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::State { type_name, .. } => Some(type_name),
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Erased single-step fold, resolved from a projector registry.
pub type PayloadFold = fn(&TagStatePayload, &Event) -> DomainResult<TagStatePayload>;

/// Fold one event through `P`, erasing the typed state on both sides.
pub fn fold_payload<P: TagProjector>(
    payload: &TagStatePayload,
    event: &Event,
) -> DomainResult<TagStatePayload> {
    let state = payload.decode::<P>()?;
    let next = P::project(state, event)?;
    TagStatePayload::from_state::<P>(&next)
}

/// The fold of one tag's events through one projector.
///
/// Invariant: `version` is the number of folded events and
/// `last_sorted_unique_id` is the id of the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagState {
    pub payload: TagStatePayload,
    pub version: u64,
    pub last_sorted_unique_id: Option<SortableUniqueId>,
    pub tag_group: String,
    pub tag_content: String,
    pub projector_name: String,
    pub projector_version: String,
}

impl TagState {
    pub fn empty(id: &TagStateId, projector_version: impl Into<String>) -> Self {
        Self {
            payload: TagStatePayload::Empty,
            version: 0,
            last_sorted_unique_id: None,
            tag_group: id.tag_group.clone(),
            tag_content: id.tag_content.clone(),
            projector_name: id.projector.clone(),
            projector_version: projector_version.into(),
        }
    }

    pub fn id(&self) -> TagStateId {
        TagStateId {
            tag_group: self.tag_group.clone(),
            tag_content: self.tag_content.clone(),
            projector: self.projector_name.clone(),
        }
    }

    pub fn is_compatible_with(&self, projector_name: &str, projector_version: &str) -> bool {
        self.projector_name == projector_name && self.projector_version == projector_version
    }

    /// Fold one event with an erased fold function.
    pub fn fold_event(&mut self, fold: PayloadFold, event: &Event) -> DomainResult<()> {
        let next = fold(&self.payload, event)?;
        self.advance(next, event);
        Ok(())
    }

    /// Fold one event through `P`, returning the typed result.
    pub fn apply<P: TagProjector>(&mut self, event: &Event) -> DomainResult<P::State> {
        if self.projector_name != P::NAME {
            return Err(DomainError::invariant(format!(
                "tag state of '{}' folded with projector '{}'",
                self.projector_name,
                P::NAME
            )));
        }
        let next = P::project(self.payload.decode::<P>()?, event)?;
        let payload = TagStatePayload::from_state::<P>(&next)?;
        self.advance(payload, event);
        Ok(next)
    }

    pub fn decode<P: TagProjector>(&self) -> DomainResult<P::State> {
        self.payload.decode::<P>()
    }

    fn advance(&mut self, payload: TagStatePayload, event: &Event) {
        self.payload = payload;
        self.version += 1;
        self.last_sorted_unique_id = Some(event.sortable_id.clone());
    }
}
