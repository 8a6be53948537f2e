//! `dcbkit-core`: primitives of the dynamic consistency boundary model.
//!
//! This crate contains **pure** building blocks (no storage or runtime
//! concerns): ordering ids, tags, identifiers, a clock seam and the domain
//! error type.

pub mod clock;
pub mod error;
pub mod id;
pub mod sortable_id;
pub mod tag;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{EventId, ReservationToken};
pub use sortable_id::SortableUniqueId;
pub use tag::{Tag, TagStateId};
