//! Events, tag projectors and the safe/unsafe projection engine.
//!
//! Everything here is synchronous and storage-free; stores, reservations and
//! hosting live in `dcbkit-infra`.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod multi_projector;
pub mod projection;
pub mod runner;
pub mod safe_unsafe;
pub mod tag_state;

pub use bus::{EventBus, Subscription};
pub use event::{Event, EventPayload};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use multi_projector::GenericTagMultiProjector;
pub use projection::TagProjector;
pub use runner::{MultiProjectionRunner, ProjectionCursor};
pub use safe_unsafe::{ItemFold, SafeUnsafeProjectionState};
pub use tag_state::{PayloadFold, TagState, TagStatePayload, fold_payload};
