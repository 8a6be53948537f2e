//! Infrastructure layer: event store, per-tag reservations, tag-state caches,
//! hosting, config and workers.

pub mod config;
pub mod event_store;
pub mod host;
pub mod read_model;
pub mod registry;
pub mod reservation;
pub mod reservation_set;
pub mod snapshot;
pub mod tag_state;
pub mod workers;


pub use config::{ConfigError, DcbConfig};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, PublishingEventStore};
pub use host::TagHost;
pub use read_model::{InMemoryTagStateStore, TagStateStore};
pub use registry::{ProjectorEntry, ProjectorRegistry};
pub use reservation::{ConflictReason, ReservationError, TagConsistency, TagWriteReservation};
pub use reservation_set::{ReservationSet, ReservationSetError};
pub use snapshot::{SnapshotError, decode_tag_state, decode_tag_state_for, encode_tag_state};
pub use tag_state::{TagStateCache, TagStateError};
pub use workers::{ProjectionWorker, WorkerHandle};
