//! Reservations across every consistency tag of one write.
//!
//! Tags are only atomic one at a time. A `ReservationSet` acquires all of a
//! write's reservations in a fixed order, compensates (cancels) on the first
//! failure, and surfaces a partial confirmation as an error instead of
//! retrying it.

use std::fmt;

use thiserror::Error;
use tracing::{error, warn};

use dcbkit_core::{Clock, SortableUniqueId, Tag};
use dcbkit_events::Event;

use crate::event_store::{EventStore, EventStoreError, with_timeout};
use crate::host::TagHost;
use crate::reservation::{ReservationError, TagWriteReservation};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReservationSetError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),

    /// The append failed; every reservation was cancelled.
    #[error("append failed: {0}")]
    Append(#[from] EventStoreError),

    /// Events are stored but only some tags were confirmed. Needs reconciliation.
    #[error("{} of {} tags confirmed; failed: {}", .confirmed.len(), .confirmed.len() + .failed.len(), TagList(.failed))]
    PartialConfirmation {
        confirmed: Vec<Tag>,
        failed: Vec<(Tag, ReservationError)>,
    },

    #[error("cancel failed for: {}", TagList(.0))]
    Cancel(Vec<(Tag, ReservationError)>),
}

struct TagList<'a>(&'a [(Tag, ReservationError)]);

impl fmt::Display for TagList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (tag, _)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

/// Outstanding reservations of one write, ordered by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSet {
    reservations: Vec<TagWriteReservation>,
}

impl ReservationSet {
    /// Reserve every consistency tag in `observed` (tag → last id the writer
    /// read). Projection-only tags are skipped; duplicates keep the first entry.
    pub async fn acquire<S, C>(
        host: &TagHost<S, C>,
        observed: impl IntoIterator<Item = (Tag, Option<SortableUniqueId>)>,
    ) -> Result<Self, ReservationSetError>
    where
        S: EventStore + Clone,
        C: Clock + Clone,
    {
        let mut wanted: Vec<_> = observed
            .into_iter()
            .filter(|(tag, _)| tag.is_consistency())
            .collect();
        wanted.sort_by(|(a, _), (b, _)| (a.group(), a.content()).cmp(&(b.group(), b.content())));
        wanted.dedup_by(|(a, _), (b, _)| a == b);

        let mut acquired = Self {
            reservations: Vec::with_capacity(wanted.len()),
        };
        for (tag, last) in wanted {
            match host.make_reservation(&tag, last.as_ref()).await {
                Ok(reservation) => acquired.reservations.push(reservation),
                Err(err) => {
                    if let Err(cancel) = acquired.cancel_all(host).await {
                        warn!(error = %cancel, "rollback after failed acquisition was incomplete");
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(acquired)
    }

    pub fn reservations(&self) -> &[TagWriteReservation] {
        &self.reservations
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.reservations.iter().map(|r| &r.tag)
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    /// Confirm each tag with the last of `committed` that carries it. A tag
    /// with no committed event is released instead.
    pub async fn confirm_all<S, C>(
        self,
        host: &TagHost<S, C>,
        committed: &[Event],
    ) -> Result<(), ReservationSetError>
    where
        S: EventStore + Clone,
        C: Clock + Clone,
    {
        let mut confirmed = Vec::new();
        let mut failed = Vec::new();

        for reservation in &self.reservations {
            let last = committed
                .iter()
                .filter(|e| e.has_tag(&reservation.tag))
                .map(|e| &e.sortable_id)
                .max();
            let outcome = match last {
                Some(id) => host.confirm_reservation(reservation, id).await,
                None => host.cancel_reservation(reservation).await,
            };
            match outcome {
                Ok(()) => confirmed.push(reservation.tag.clone()),
                Err(err) => failed.push((reservation.tag.clone(), err)),
            }
        }

        match (confirmed.is_empty(), failed.is_empty()) {
            (_, true) => Ok(()),
            (true, false) => Err(failed.swap_remove(0).1.into()),
            (false, false) => {
                error!(
                    confirmed = confirmed.len(),
                    failed = failed.len(),
                    "partial confirmation across tags"
                );
                Err(ReservationSetError::PartialConfirmation { confirmed, failed })
            }
        }
    }

    /// Release every reservation; continues past failures and reports them together.
    pub async fn cancel_all<S, C>(&self, host: &TagHost<S, C>) -> Result<(), ReservationSetError>
    where
        S: EventStore + Clone,
        C: Clock + Clone,
    {
        let mut failed = Vec::new();
        for reservation in &self.reservations {
            if let Err(err) = host.cancel_reservation(reservation).await {
                failed.push((reservation.tag.clone(), err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ReservationSetError::Cancel(failed))
        }
    }

    /// Append `events` and confirm every reservation, or cancel them all if
    /// the append fails.
    pub async fn append_and_confirm<S, C>(
        self,
        host: &TagHost<S, C>,
        store: &S,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, ReservationSetError>
    where
        S: EventStore + Clone,
        C: Clock + Clone,
    {
        let committed = match with_timeout(host.config().store_call_timeout, store.append(events)).await {
            Ok(committed) => committed,
            Err(err) => {
                if let Err(cancel) = self.cancel_all(host).await {
                    warn!(error = %cancel, "cancel after failed append was incomplete");
                }
                return Err(err.into());
            }
        };
        self.confirm_all(host, &committed).await?;
        Ok(committed)
    }
}
