use core::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;

use dcbkit_core::DomainResult;

use crate::Event;

/// A tag projector folds the events of one tag into a state.
///
/// `TagState(tag, projector)` is defined as `project` folded, in
/// `SortableUniqueId` order, over every event carrying `tag`, starting from
/// `Self::State::default()`. Caches, multi-tag projections and snapshots are
/// all just memoized prefixes of that fold.
///
/// ## Purity
///
/// `project` must be **referentially transparent**: identical `(state, event)`
/// always yields an identical result, with no side effects (no clock reads, no
/// random ids, no I/O). Replay, cache refresh and out-of-order recomputation all
/// depend on being able to run the fold again and get the same answer.
///
/// ## Versioning
///
/// `(NAME, VERSION)` identifies the fold. Any change to what `project` computes
/// must bump `VERSION`; cached states built by an older version are then
/// discarded and refolded from empty rather than patched.
///
/// ## Unknown events
///
/// Events the projector does not care about must return the state unchanged.
/// Returning an error is reserved for payloads that claim a known type but fail
/// to decode.
///
/// ## Tombstones
///
/// Multi-tag projections drop an item whose state reports `is_deleted`, so a
/// "deleted" event can remove a tag from list views while its single-tag
/// state still records the deletion.
pub trait TagProjector: Send + Sync + 'static {
    /// Stable projector name (used in cache keys and snapshots).
    const NAME: &'static str;

    /// Fold version; bump whenever `project` changes meaning.
    const VERSION: &'static str;

    type State: Default + Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn project(state: Self::State, event: &Event) -> DomainResult<Self::State>;

    fn is_deleted(_state: &Self::State) -> bool {
        false
    }
}
