//! Per-tag write reservation protocol.
//!
//! One [`TagConsistency`] guards one tag:
//!
//! ```text
//! Idle ──make──▶ Reserved(token, baseline, expiry) ──confirm──▶ Idle(new baseline)
//!                      │ ──cancel──▶ Idle
//!                      └ ──expiry──▶ Idle
//! ```
//!
//! Every call on one instance is serialized through its own async mutex, so
//! different tags never contend. Correctness rests on three things: that
//! serialization, the baseline check in `make_reservation`, and confirm/cancel
//! being the only ways (besides expiry) to resolve a reservation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use dcbkit_core::{Clock, ReservationToken, SortableUniqueId, Tag};

use crate::config::DcbConfig;
use crate::event_store::{EventStore, EventStoreError, with_timeout};

/// Exclusive, time-boxed claim on the right to advance one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWriteReservation {
    pub token: ReservationToken,
    pub tag: Tag,
    /// Last committed id the writer observed (`None` for a new tag).
    pub baseline: Option<SortableUniqueId>,
    pub expires_at: DateTime<Utc>,
}

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another writer holds an unexpired reservation.
    AlreadyReserved { expires_at: DateTime<Utc> },
    /// The tag advanced past what the writer observed.
    BaselineMismatch {
        observed: Option<SortableUniqueId>,
        actual: Option<SortableUniqueId>,
    },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyReserved { expires_at } => {
                write!(f, "tag already reserved until {expires_at}")
            }
            Self::BaselineMismatch { observed, actual } => write!(
                f,
                "observed last id {} but tag is at {}",
                display_id(observed.as_ref()),
                display_id(actual.as_ref())
            ),
        }
    }
}

fn display_id(id: Option<&SortableUniqueId>) -> &str {
    id.map(SortableUniqueId::as_str).unwrap_or("<empty>")
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReservationError {
    /// Recoverable: re-read the tag and retry from scratch.
    #[error("conflict on tag {tag}: {reason}")]
    Conflict { tag: Tag, reason: ConflictReason },

    /// Protocol violation: the token is not (or no longer) outstanding.
    #[error("reservation {token} is not outstanding on tag {tag}")]
    UnknownReservation { tag: Tag, token: ReservationToken },

    /// Protocol violation: the reservation timed out before it was resolved.
    #[error("reservation {token} on tag {tag} expired at {expired_at}")]
    Expired {
        tag: Tag,
        token: ReservationToken,
        expired_at: DateTime<Utc>,
    },

    #[error("reservation for tag {reserved} presented to tag {actual}")]
    TagMismatch { reserved: Tag, actual: Tag },

    /// Protocol violation: the committed id does not move the tag forward.
    #[error("commit {committed} on tag {tag} is not later than baseline {}", display_id(.baseline.as_ref()))]
    NonMonotonicCommit {
        tag: Tag,
        baseline: Option<SortableUniqueId>,
        committed: SortableUniqueId,
    },

    /// Retryable when the underlying store error is.
    #[error("store call failed for tag {tag}: {source}")]
    Store {
        tag: Tag,
        #[source]
        source: EventStoreError,
    },
}

impl ReservationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Store { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Errors that leave a possibly-stored event without a consistency guarantee.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownReservation { .. }
                | Self::Expired { .. }
                | Self::TagMismatch { .. }
                | Self::NonMonotonicCommit { .. }
        )
    }
}

#[derive(Debug, Default)]
struct TagSlot {
    last_committed: Option<SortableUniqueId>,
    /// False until the first store read, and again after `notify_event_written`.
    fresh: bool,
    active: Option<TagWriteReservation>,
    last_expired: Option<(ReservationToken, DateTime<Utc>)>,
}

/// Reservation state machine for one tag.
#[derive(Debug)]
pub struct TagConsistency<S, C> {
    tag: Tag,
    store: S,
    clock: C,
    reservation_expiry: Duration,
    store_call_timeout: Duration,
    slot: Mutex<TagSlot>,
}

impl<S, C> TagConsistency<S, C>
where
    S: EventStore,
    C: Clock,
{
    pub fn new(tag: Tag, store: S, clock: C, config: &DcbConfig) -> Self {
        Self {
            tag,
            store,
            clock,
            reservation_expiry: config.reservation_expiry,
            store_call_timeout: config.store_call_timeout,
            slot: Mutex::new(TagSlot::default()),
        }
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Authoritative last committed id, refreshed from the store when stale.
    pub async fn latest_committed_id(&self) -> Result<Option<SortableUniqueId>, ReservationError> {
        let mut slot = self.slot.lock().await;
        self.refresh_if_stale(&mut slot).await?;
        Ok(slot.last_committed.clone())
    }

    /// Reserve the tag for a writer that observed `observed` as its last id.
    ///
    /// Fails with `Conflict` while another unexpired reservation is held or
    /// when `observed` differs from the actual last committed id. Never retries.
    pub async fn make_reservation(
        &self,
        observed: Option<&SortableUniqueId>,
    ) -> Result<TagWriteReservation, ReservationError> {
        let mut slot = self.slot.lock().await;
        let now = self.clock.now();
        self.sweep_expired(&mut slot, now);

        if let Some(active) = &slot.active {
            debug!(tag = %self.tag, holder = %active.token, "reservation refused: tag busy");
            return Err(ReservationError::Conflict {
                tag: self.tag.clone(),
                reason: ConflictReason::AlreadyReserved {
                    expires_at: active.expires_at,
                },
            });
        }

        self.refresh_if_stale(&mut slot).await?;
        if slot.last_committed.as_ref() != observed {
            debug!(
                tag = %self.tag,
                observed = display_id(observed),
                actual = display_id(slot.last_committed.as_ref()),
                "reservation refused: stale baseline"
            );
            return Err(ReservationError::Conflict {
                tag: self.tag.clone(),
                reason: ConflictReason::BaselineMismatch {
                    observed: observed.cloned(),
                    actual: slot.last_committed.clone(),
                },
            });
        }

        let expires_at = TimeDelta::from_std(self.reservation_expiry)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let reservation = TagWriteReservation {
            token: ReservationToken::new(),
            tag: self.tag.clone(),
            baseline: slot.last_committed.clone(),
            expires_at,
        };
        slot.active = Some(reservation.clone());
        debug!(tag = %self.tag, token = %reservation.token, %expires_at, "reservation granted");
        Ok(reservation)
    }

    /// Resolve `reservation` after its events were durably appended.
    ///
    /// `committed` becomes the tag's last committed id. Any failure here is a
    /// protocol violation: the event may be stored without the consistency
    /// guarantee and needs reconciliation.
    pub async fn confirm_reservation(
        &self,
        reservation: &TagWriteReservation,
        committed: &SortableUniqueId,
    ) -> Result<(), ReservationError> {
        self.check_tag(reservation)?;
        let mut slot = self.slot.lock().await;
        self.sweep_expired(&mut slot, self.clock.now());
        self.check_outstanding(&slot, reservation)?;

        if reservation
            .baseline
            .as_ref()
            .is_some_and(|baseline| committed <= baseline)
        {
            let err = ReservationError::NonMonotonicCommit {
                tag: self.tag.clone(),
                baseline: reservation.baseline.clone(),
                committed: committed.clone(),
            };
            error!(tag = %self.tag, token = %reservation.token, error = %err, "confirm rejected");
            return Err(err);
        }

        slot.last_committed = Some(committed.clone());
        slot.fresh = true;
        slot.active = None;
        debug!(tag = %self.tag, token = %reservation.token, %committed, "reservation confirmed");
        Ok(())
    }

    /// Release `reservation` without moving the baseline.
    pub async fn cancel_reservation(
        &self,
        reservation: &TagWriteReservation,
    ) -> Result<(), ReservationError> {
        self.check_tag(reservation)?;
        let mut slot = self.slot.lock().await;
        self.sweep_expired(&mut slot, self.clock.now());
        self.check_outstanding(&slot, reservation)?;

        slot.active = None;
        debug!(tag = %self.tag, token = %reservation.token, "reservation cancelled");
        Ok(())
    }

    /// An event for this tag was written through some other path; re-read the
    /// last committed id from the store on the next call.
    pub async fn notify_event_written(&self) {
        let mut slot = self.slot.lock().await;
        slot.fresh = false;
    }

    /// No call in flight and no unexpired reservation outstanding.
    pub fn is_idle(&self) -> bool {
        let Ok(slot) = self.slot.try_lock() else {
            return false;
        };
        let now = self.clock.now();
        slot.active.as_ref().is_none_or(|r| r.expires_at <= now)
    }

    /// Currently outstanding, unexpired reservation.
    pub async fn active_reservation(&self) -> Option<TagWriteReservation> {
        let mut slot = self.slot.lock().await;
        self.sweep_expired(&mut slot, self.clock.now());
        slot.active.clone()
    }

    async fn refresh_if_stale(&self, slot: &mut TagSlot) -> Result<(), ReservationError> {
        if slot.fresh {
            return Ok(());
        }
        match with_timeout(self.store_call_timeout, self.store.latest_for_tag(&self.tag)).await {
            Ok(latest) => {
                slot.last_committed = latest;
                slot.fresh = true;
                Ok(())
            }
            Err(source) => {
                // Keep the previous id and stay stale: no decision is made on it.
                warn!(tag = %self.tag, error = %source, "failed to refresh last committed id");
                Err(ReservationError::Store {
                    tag: self.tag.clone(),
                    source,
                })
            }
        }
    }

    fn sweep_expired(&self, slot: &mut TagSlot, now: DateTime<Utc>) {
        let expired = slot.active.as_ref().is_some_and(|r| r.expires_at <= now);
        if !expired {
            return;
        }
        if let Some(r) = slot.active.take() {
            info!(tag = %self.tag, token = %r.token, expired_at = %r.expires_at, "reservation expired");
            slot.last_expired = Some((r.token, r.expires_at));
        }
    }

    fn check_tag(&self, reservation: &TagWriteReservation) -> Result<(), ReservationError> {
        if reservation.tag != self.tag {
            let err = ReservationError::TagMismatch {
                reserved: reservation.tag.clone(),
                actual: self.tag.clone(),
            };
            error!(tag = %self.tag, token = %reservation.token, error = %err, "protocol violation");
            return Err(err);
        }
        Ok(())
    }

    fn check_outstanding(
        &self,
        slot: &TagSlot,
        reservation: &TagWriteReservation,
    ) -> Result<(), ReservationError> {
        if slot
            .active
            .as_ref()
            .is_some_and(|active| active.token == reservation.token)
        {
            return Ok(());
        }

        let err = match slot.last_expired {
            Some((token, expired_at)) if token == reservation.token => ReservationError::Expired {
                tag: self.tag.clone(),
                token,
                expired_at,
            },
            _ => ReservationError::UnknownReservation {
                tag: self.tag.clone(),
                token: reservation.token,
            },
        };
        error!(tag = %self.tag, token = %reservation.token, error = %err, "protocol violation");
        Err(err)
    }
}
