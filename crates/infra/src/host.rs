//! In-process host for per-tag instances.
//!
//! `TagHost` keeps a directory of [`TagConsistency`] (one per tag) and
//! [`TagStateCache`] (one per `(tag, projector)`), activated on first use.
//! Each instance serializes its own calls; the directory lock only guards
//! lookup and insertion and is never held across an await.
//!
//! [`TagHost::evict_idle`] deactivates instances nobody holds. A deactivated
//! tag re-reads its last committed id from the store on next use, and its tag
//! states reseed from the [`TagStateStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use dcbkit_core::{Clock, SortableUniqueId, Tag, TagStateId};
use dcbkit_events::{Event, GenericTagMultiProjector, MultiProjectionRunner, TagProjector, TagState};

use crate::config::DcbConfig;
use crate::event_store::EventStore;
use crate::read_model::TagStateStore;
use crate::registry::ProjectorRegistry;
use crate::reservation::{ReservationError, TagConsistency, TagWriteReservation};
use crate::tag_state::{TagStateCache, TagStateError};

pub struct TagHost<S, C> {
    store: S,
    clock: C,
    config: DcbConfig,
    registry: Arc<ProjectorRegistry>,
    persistence: Arc<dyn TagStateStore>,
    consistency: Mutex<HashMap<Tag, Arc<TagConsistency<S, C>>>>,
    caches: Mutex<HashMap<TagStateId, Arc<TagStateCache<S, C>>>>,
}

impl<S, C> TagHost<S, C>
where
    S: EventStore + Clone,
    C: Clock + Clone,
{
    pub fn new(
        store: S,
        clock: C,
        config: DcbConfig,
        registry: ProjectorRegistry,
        persistence: Arc<dyn TagStateStore>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            registry: Arc::new(registry),
            persistence,
            consistency: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DcbConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProjectorRegistry {
        &self.registry
    }

    /// The tag's consistency instance, activated on first use.
    pub fn consistency(&self, tag: &Tag) -> Arc<TagConsistency<S, C>> {
        let mut directory = self.consistency.lock().unwrap_or_else(|p| p.into_inner());
        directory
            .entry(tag.clone())
            .or_insert_with(|| {
                debug!(%tag, "activating tag consistency");
                Arc::new(TagConsistency::new(
                    tag.clone(),
                    self.store.clone(),
                    self.clock.clone(),
                    &self.config,
                ))
            })
            .clone()
    }

    /// The `(tag, projector)` cache, activated on first use.
    pub fn cache(&self, tag: &Tag, projector: &str) -> Arc<TagStateCache<S, C>> {
        let id = TagStateId::new(tag, projector);
        if let Some(cache) = self.lock_caches().get(&id) {
            return cache.clone();
        }

        let consistency = self.consistency(tag);
        let mut caches = self.lock_caches();
        caches
            .entry(id)
            .or_insert_with(|| {
                debug!(%tag, projector, "activating tag state cache");
                Arc::new(TagStateCache::new(
                    projector,
                    consistency,
                    self.store.clone(),
                    self.registry.clone(),
                    self.persistence.clone(),
                    self.config.store_call_timeout,
                ))
            })
            .clone()
    }

    /// Multi-tag projection over `tag_group` using the configured safe window
    /// and the host's clock.
    pub fn multi_projection_runner<P: TagProjector>(
        &self,
        tag_group: impl Into<String>,
    ) -> MultiProjectionRunner<P, C> {
        MultiProjectionRunner::new(
            GenericTagMultiProjector::new(tag_group),
            self.config.safe_window,
            self.clock.clone(),
        )
    }

    pub async fn latest_committed_id(
        &self,
        tag: &Tag,
    ) -> Result<Option<SortableUniqueId>, ReservationError> {
        self.consistency(tag).latest_committed_id().await
    }

    pub async fn make_reservation(
        &self,
        tag: &Tag,
        observed: Option<&SortableUniqueId>,
    ) -> Result<TagWriteReservation, ReservationError> {
        self.consistency(tag).make_reservation(observed).await
    }

    pub async fn confirm_reservation(
        &self,
        reservation: &TagWriteReservation,
        committed: &SortableUniqueId,
    ) -> Result<(), ReservationError> {
        self.consistency(&reservation.tag)
            .confirm_reservation(reservation, committed)
            .await
    }

    pub async fn cancel_reservation(
        &self,
        reservation: &TagWriteReservation,
    ) -> Result<(), ReservationError> {
        self.consistency(&reservation.tag)
            .cancel_reservation(reservation)
            .await
    }

    pub async fn notify_event_written(&self, tag: &Tag) {
        self.consistency(tag).notify_event_written().await;
    }

    /// Mark every already-active tag of `events` stale. Tags that were never
    /// activated catch up from the store on first use anyway.
    pub async fn notify_events_written(&self, events: &[Event]) {
        let active: HashMap<Tag, Arc<TagConsistency<S, C>>> = {
            let directory = self.consistency.lock().unwrap_or_else(|p| p.into_inner());
            events
                .iter()
                .flat_map(|e| e.tags.iter())
                .filter_map(|tag| directory.get(tag).map(|instance| (tag.clone(), instance.clone())))
                .collect()
        };
        for instance in active.into_values() {
            instance.notify_event_written().await;
        }
    }

    pub async fn get_tag_state(&self, tag: &Tag, projector: &str) -> Result<TagState, TagStateError> {
        self.cache(tag, projector).get_tag_state().await
    }

    /// Typed read through `P`, which must be registered.
    pub async fn get_state<P: TagProjector>(&self, tag: &Tag) -> Result<P::State, TagStateError> {
        let state = self.get_tag_state(tag, P::NAME).await?;
        Ok(state.decode::<P>()?)
    }

    pub async fn clear_tag_state(&self, tag: &Tag, projector: &str) {
        self.cache(tag, projector).clear().await;
    }

    pub fn active_tags(&self) -> usize {
        self.consistency.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn active_caches(&self) -> usize {
        self.lock_caches().len()
    }

    /// Deactivate instances with no holder outside the directory, no call in
    /// flight and no unexpired reservation. Returns the number of tags
    /// deactivated; meant to be called periodically.
    pub fn evict_idle(&self) -> usize {
        // Caches hold their tag's consistency instance, so they go first.
        let caches_evicted = {
            let mut caches = self.lock_caches();
            let before = caches.len();
            caches.retain(|_, cache| Arc::strong_count(cache) > 1 || !cache.is_idle());
            before - caches.len()
        };

        let mut directory = self.consistency.lock().unwrap_or_else(|p| p.into_inner());
        let before = directory.len();
        directory.retain(|_, instance| Arc::strong_count(instance) > 1 || !instance.is_idle());
        let evicted = before - directory.len();
        if evicted > 0 || caches_evicted > 0 {
            debug!(
                tags = evicted,
                caches = caches_evicted,
                remaining = directory.len(),
                "deactivated idle tag instances"
            );
        }
        evicted
    }

    fn lock_caches(&self) -> std::sync::MutexGuard<'_, HashMap<TagStateId, Arc<TagStateCache<S, C>>>> {
        self.caches.lock().unwrap_or_else(|p| p.into_inner())
    }
}
