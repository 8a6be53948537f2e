//! Time-ordered, lexicographically sortable event identifiers.
//!
//! A [`SortableUniqueId`] is 30 ASCII digits: a 19-digit, zero-padded tick
//! count (100ns ticks since `0001-01-01T00:00:00Z`) followed by an 11-digit
//! discriminator derived from a UUID. Because the layout is fixed-width and
//! digits-only, plain string ordering equals chronological ordering (within
//! tick resolution), ties are broken by the discriminator, and the value can be
//! used directly as a range/partition key by stores.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

const TICK_DIGITS: usize = 19;
const DISCRIMINATOR_DIGITS: usize = 11;
const ID_LENGTH: usize = TICK_DIGITS + DISCRIMINATOR_DIGITS;
const DISCRIMINATOR_MODULUS: u128 = 100_000_000_000;

/// Ticks between `0001-01-01` and the Unix epoch.
const UNIX_EPOCH_TICKS: i128 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i128 = 10_000_000;
const NANOS_PER_TICK: i128 = 100;

/// Opaque, totally ordered event identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortableUniqueId(String);

impl SortableUniqueId {
    /// Build an id from a creation timestamp and a discriminator.
    ///
    /// Timestamps before `0001-01-01` clamp to tick zero.
    pub fn generate(timestamp: DateTime<Utc>, discriminator: Uuid) -> Self {
        let ticks = ticks_of(timestamp);
        let disc = discriminator.as_u128() % DISCRIMINATOR_MODULUS;
        Self(format!("{ticks:019}{disc:011}"))
    }

    /// Fresh id for "now" with a random discriminator.
    pub fn generate_new() -> Self {
        Self::generate(Utc::now(), Uuid::new_v4())
    }

    /// Smallest id that can be produced at `timestamp`.
    ///
    /// Every id generated at or after `timestamp` compares greater than or
    /// equal to this value.
    pub fn threshold(timestamp: DateTime<Utc>) -> Self {
        Self::generate(timestamp, Uuid::nil())
    }

    /// Threshold id for a safe window ending at `now`, i.e. `threshold(now - window)`.
    pub fn safe_window_threshold(now: DateTime<Utc>, window: Duration) -> Self {
        let start = TimeDelta::from_std(window)
            .ok()
            .and_then(|delta| now.checked_sub_signed(delta))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::threshold(start)
    }

    /// Check whether `s` is a well-formed id.
    pub fn is_valid(s: &str) -> bool {
        s.len() == ID_LENGTH && s.bytes().all(|b| b.is_ascii_digit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw tick component (100ns ticks since `0001-01-01`).
    pub fn ticks(&self) -> u64 {
        // Validated at construction: 19 ASCII digits always fit in u64.
        self.0[..TICK_DIGITS].parse().unwrap_or_default()
    }

    /// Creation timestamp encoded in the id.
    ///
    /// `None` when the encoded ticks fall outside the representable range.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let since_epoch = i128::from(self.ticks()) - UNIX_EPOCH_TICKS;
        let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
        let sub_ticks = since_epoch.rem_euclid(TICKS_PER_SECOND);
        let secs = i64::try_from(secs).ok()?;
        let nanos = u32::try_from(sub_ticks * NANOS_PER_TICK).ok()?;
        DateTime::from_timestamp(secs, nanos)
    }

    pub fn is_later_than(&self, other: &SortableUniqueId) -> bool {
        self > other
    }

    pub fn is_later_than_or_equal(&self, other: &SortableUniqueId) -> bool {
        self >= other
    }

    pub fn is_earlier_than(&self, other: &SortableUniqueId) -> bool {
        self < other
    }

    pub fn is_earlier_than_or_equal(&self, other: &SortableUniqueId) -> bool {
        self <= other
    }
}

fn ticks_of(timestamp: DateTime<Utc>) -> u64 {
    let ticks = UNIX_EPOCH_TICKS
        + i128::from(timestamp.timestamp()) * TICKS_PER_SECOND
        + i128::from(timestamp.timestamp_subsec_nanos()) / NANOS_PER_TICK;
    u64::try_from(ticks.max(0)).unwrap_or(u64::MAX)
}

impl fmt::Display for SortableUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SortableUniqueId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(DomainError::invalid_id(format!(
                "SortableUniqueId: expected {ID_LENGTH} digits, got '{s}'"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for SortableUniqueId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !Self::is_valid(&value) {
            return Err(DomainError::invalid_id(format!(
                "SortableUniqueId: expected {ID_LENGTH} digits, got '{value}'"
            )));
        }
        Ok(Self(value))
    }
}

impl From<SortableUniqueId> for String {
    fn from(value: SortableUniqueId) -> Self {
        value.0
    }
}

impl AsRef<str> for SortableUniqueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
