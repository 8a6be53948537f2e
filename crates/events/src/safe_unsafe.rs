//! Safe/unsafe dual-view projection state.
//!
//! Multi-tag projections receive events over at-least-once channels (catch-up
//! reads and push streams), so arrival order can differ from commit order and
//! duplicates happen. This module keeps two views per item key:
//!
//! - **current**: every event folded in arrival order. Always available, may
//!   transiently reflect a wrong order.
//! - **safe**: per key, the events at or below a caller-supplied threshold,
//!   sorted by `SortableUniqueId` and folded from the last promoted baseline.
//!   Delivery delay is assumed bounded by the safe window, so this view is
//!   deterministic regardless of arrival order.
//!
//! Events above the threshold are buffered per key (keyed by id, so duplicates
//! collapse). Each call to [`SafeUnsafeProjectionState::process_event`] first
//! promotes buffered events that have fallen behind the threshold into the
//! key's baseline.
//!
//! Redelivery is detected per key without remembering every event: a buffered
//! event is found in its key's buffer, and an event at or below the key's
//! watermark (highest id folded into the safe lineage) was already applied.
//! Safe events reach a key in id order, so memory stays proportional to the
//! number of keys and buffered events.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

use dcbkit_core::SortableUniqueId;

use crate::Event;

/// Key selection and per-item fold used by [`SafeUnsafeProjectionState`].
///
/// `fold_item` returning `Ok(None)` is a tombstone: the item is removed from
/// the view being computed.
pub trait ItemFold<K, V> {
    type Error;

    fn affected_keys(&self, event: &Event) -> Vec<K>;

    fn fold_item(&self, key: &K, current: Option<V>, event: &Event) -> Result<Option<V>, Self::Error>;
}

#[derive(Debug, Clone)]
struct PendingItem<V> {
    /// Item value with every promoted (safe) event applied.
    baseline: Option<V>,
    /// Events above the last threshold, ordered by id.
    events: BTreeMap<SortableUniqueId, Event>,
}

/// Dual-view store from item key `K` to item value `V`.
///
/// Mutation must be serialized by the owner; [`get_safe_state`] only needs
/// `&self`, so readers can work on a clone.
///
/// [`get_safe_state`]: SafeUnsafeProjectionState::get_safe_state
#[derive(Debug, Clone)]
pub struct SafeUnsafeProjectionState<K, V> {
    current: HashMap<K, V>,
    pending: HashMap<K, PendingItem<V>>,
    /// Highest id folded into each key's safe lineage.
    watermarks: HashMap<K, SortableUniqueId>,
}

impl<K, V> Default for SafeUnsafeProjectionState<K, V> {
    fn default() -> Self {
        Self {
            current: HashMap::new(),
            pending: HashMap::new(),
            watermarks: HashMap::new(),
        }
    }
}

impl<K, V> SafeUnsafeProjectionState<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already-safe map (e.g. a restored snapshot).
    pub fn from_current(current: HashMap<K, V>) -> Self {
        Self {
            current,
            pending: HashMap::new(),
            watermarks: HashMap::new(),
        }
    }

    /// Apply one delivered event.
    ///
    /// Buffered events at or below `threshold` are promoted first. A
    /// redelivered event leaves both views untouched for every key that has
    /// already seen it. On error nothing from this event is applied.
    pub fn process_event<F>(
        &mut self,
        event: &Event,
        fold: &F,
        threshold: &SortableUniqueId,
    ) -> Result<(), F::Error>
    where
        F: ItemFold<K, V>,
    {
        self.promote_safe_events(threshold, fold)?;

        let mut keys = fold.affected_keys(event);
        dedup_keys(&mut keys);
        keys.retain(|key| !self.has_applied(key, &event.sortable_id));
        if keys.is_empty() {
            return Ok(());
        }
        let is_safe = event.sortable_id <= *threshold;

        let mut current_updates = Vec::with_capacity(keys.len());
        let mut baseline_updates = Vec::new();
        for key in keys {
            if is_safe {
                if let Some(pending) = self.pending.get(&key) {
                    let baseline = fold.fold_item(&key, pending.baseline.clone(), event)?;
                    baseline_updates.push((key.clone(), baseline));
                }
            }
            let next = fold.fold_item(&key, self.current.get(&key).cloned(), event)?;
            current_updates.push((key, next));
        }

        for (key, baseline) in baseline_updates {
            if let Some(pending) = self.pending.get_mut(&key) {
                pending.baseline = baseline;
            }
        }
        for (key, next) in current_updates {
            if is_safe {
                self.raise_watermark(&key, &event.sortable_id);
            } else {
                let baseline = self.current.get(&key).cloned();
                self.pending
                    .entry(key.clone())
                    .or_insert_with(|| PendingItem {
                        baseline,
                        events: BTreeMap::new(),
                    })
                    .events
                    .insert(event.sortable_id.clone(), event.clone());
            }
            set_or_remove(&mut self.current, key, next);
        }
        Ok(())
    }

    /// Fold buffered events at or below `threshold` into their key's baseline.
    ///
    /// Keys whose buffer empties leave the unsafe set; the current value of
    /// keys that still hold events is rebuilt as baseline + remaining events in
    /// id order.
    pub fn promote_safe_events<F>(
        &mut self,
        threshold: &SortableUniqueId,
        fold: &F,
    ) -> Result<(), F::Error>
    where
        F: ItemFold<K, V>,
    {
        let mut promoted = Vec::new();
        for (key, pending) in &self.pending {
            let has_safe = pending
                .events
                .keys()
                .next()
                .is_some_and(|first| first <= threshold);
            if !has_safe {
                continue;
            }

            let mut baseline = pending.baseline.clone();
            let mut promoted_through = None;
            let mut remaining = BTreeMap::new();
            for (id, event) in &pending.events {
                if id <= threshold {
                    baseline = fold.fold_item(key, baseline, event)?;
                    promoted_through = Some(id);
                } else {
                    remaining.insert(id.clone(), event.clone());
                }
            }

            let mut current = baseline.clone();
            for event in remaining.values() {
                current = fold.fold_item(key, current, event)?;
            }
            let Some(promoted_through) = promoted_through.cloned() else {
                continue;
            };
            promoted.push((key.clone(), baseline, promoted_through, remaining, current));
        }

        for (key, baseline, promoted_through, remaining, current) in promoted {
            self.raise_watermark(&key, &promoted_through);
            if remaining.is_empty() {
                self.pending.remove(&key);
            } else {
                self.pending.insert(
                    key.clone(),
                    PendingItem {
                        baseline,
                        events: remaining,
                    },
                );
            }
            set_or_remove(&mut self.current, key, current);
        }
        Ok(())
    }

    /// Full snapshot of the safe view at `threshold`.
    ///
    /// Keys without buffered events return their current value; buffered keys
    /// are recomputed by folding their events at or below `threshold`, in id
    /// order, from the baseline.
    pub fn get_safe_state<F>(
        &self,
        threshold: &SortableUniqueId,
        fold: &F,
    ) -> Result<HashMap<K, V>, F::Error>
    where
        F: ItemFold<K, V>,
    {
        let mut result: HashMap<K, V> = self
            .current
            .iter()
            .filter(|(key, _)| !self.pending.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        for (key, pending) in &self.pending {
            let mut value = pending.baseline.clone();
            for event in pending.events.range(..=threshold.clone()).map(|(_, e)| e) {
                value = fold.fold_item(key, value, event)?;
            }
            if let Some(value) = value {
                result.insert(key.clone(), value);
            }
        }
        Ok(result)
    }

    /// Whether `key` has buffered events not yet promoted into the safe view.
    pub fn is_item_unsafe(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn current_state(&self) -> &HashMap<K, V> {
        &self.current
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.current.get(key)
    }

    pub fn unsafe_keys(&self) -> impl Iterator<Item = &K> {
        self.pending.keys()
    }

    /// Buffered events for `key`, in id order.
    pub fn unsafe_events_for(&self, key: &K) -> impl Iterator<Item = &Event> {
        self.pending
            .get(key)
            .into_iter()
            .flat_map(|pending| pending.events.values())
    }

    /// Every buffered event across keys, deduplicated and in id order.
    pub fn all_unsafe_events(&self) -> Vec<&Event> {
        let merged: BTreeMap<&SortableUniqueId, &Event> = self
            .pending
            .values()
            .flat_map(|pending| pending.events.iter())
            .collect();
        merged.into_values().collect()
    }

    /// Highest id folded into `key`'s safe lineage.
    pub fn watermark(&self, key: &K) -> Option<&SortableUniqueId> {
        self.watermarks.get(key)
    }

    fn has_applied(&self, key: &K, id: &SortableUniqueId) -> bool {
        self.watermarks.get(key).is_some_and(|mark| id <= mark)
            || self
                .pending
                .get(key)
                .is_some_and(|pending| pending.events.contains_key(id))
    }

    fn raise_watermark(&mut self, key: &K, id: &SortableUniqueId) {
        match self.watermarks.get_mut(key) {
            Some(mark) if *mark >= *id => {}
            Some(mark) => *mark = id.clone(),
            None => {
                self.watermarks.insert(key.clone(), id.clone());
            }
        }
    }
}

fn dedup_keys<K: Eq + Hash + Clone>(keys: &mut Vec<K>) {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.retain(|k| seen.insert(k.clone()));
}

fn set_or_remove<K: Eq + Hash, V>(map: &mut HashMap<K, V>, key: K, value: Option<V>) {
    match value {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}
