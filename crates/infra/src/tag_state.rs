//! Lazily refreshed tag-state cache.
//!
//! A [`TagStateCache`] materializes one `(tag, projector)` pair. On every read
//! it asks the tag's [`TagConsistency`] for the authoritative last committed
//! id and then:
//!
//! - returns the cached state when it already ends at that id,
//! - folds only the newer events when the cache is compatible but behind,
//! - refolds from empty when the projector version changed (or a persisted
//!   state is ahead of the authoritative id, e.g. after the store was reset).
//!
//! Only events up to the authoritative id are folded, so events appended
//! under a reservation that has not been confirmed stay invisible.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use dcbkit_core::{Clock, DomainError, SortableUniqueId, Tag, TagStateId};
use dcbkit_events::{Event, TagState};

use crate::event_store::{EventStore, EventStoreError, with_timeout};
use crate::read_model::TagStateStore;
use crate::registry::{ProjectorEntry, ProjectorRegistry};
use crate::reservation::{ReservationError, TagConsistency};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagStateError {
    #[error("projector '{0}' is not registered")]
    ProjectorNotFound(String),

    #[error(transparent)]
    Consistency(#[from] ReservationError),

    /// Retryable when the store error is; the cached state is kept.
    #[error("event store read failed: {0}")]
    Store(#[from] EventStoreError),

    #[error("projector fold failed: {0}")]
    Projection(#[from] DomainError),
}

impl TagStateError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Consistency(err) => err.is_retryable(),
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

enum Refresh {
    Incremental(Option<SortableUniqueId>),
    Full,
}

/// Cache for one `(tag, projector)` state.
pub struct TagStateCache<S, C> {
    id: TagStateId,
    tag: Tag,
    consistency: Arc<TagConsistency<S, C>>,
    store: S,
    registry: Arc<ProjectorRegistry>,
    persistence: Arc<dyn TagStateStore>,
    store_call_timeout: Duration,
    cached: Mutex<Option<TagState>>,
}

impl<S, C> TagStateCache<S, C>
where
    S: EventStore,
    C: Clock,
{
    pub fn new(
        projector: impl Into<String>,
        consistency: Arc<TagConsistency<S, C>>,
        store: S,
        registry: Arc<ProjectorRegistry>,
        persistence: Arc<dyn TagStateStore>,
        store_call_timeout: Duration,
    ) -> Self {
        let tag = consistency.tag().clone();
        Self {
            id: TagStateId::new(&tag, projector),
            tag,
            consistency,
            store,
            registry,
            persistence,
            store_call_timeout,
            cached: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &TagStateId {
        &self.id
    }

    /// Current state of the tag as of its last confirmed write.
    pub async fn get_tag_state(&self) -> Result<TagState, TagStateError> {
        let entry = *self
            .registry
            .get(&self.id.projector)
            .ok_or_else(|| TagStateError::ProjectorNotFound(self.id.projector.clone()))?;

        // The authoritative id is read under the cache lock: a reader queued
        // behind another must not fold to an id older than what is cached.
        let mut cached = self.cached.lock().await;
        let latest = self.consistency.latest_committed_id().await?;
        if cached.is_none() {
            *cached = self.persistence.load(&self.id);
        }

        let Some(latest) = latest else {
            let empty = TagState::empty(&self.id, entry.version);
            if cached.as_ref() != Some(&empty) {
                self.persistence.save(empty.clone());
                *cached = Some(empty.clone());
            }
            return Ok(empty);
        };

        let refresh = match cached.as_ref() {
            Some(state) if !state.is_compatible_with(entry.name, entry.version) => {
                debug!(
                    tag_state = %self.id,
                    cached_version = %state.projector_version,
                    version = entry.version,
                    "projector version changed; refolding"
                );
                Refresh::Full
            }
            Some(state) => match &state.last_sorted_unique_id {
                Some(last) if *last == latest => return Ok(state.clone()),
                Some(last) if *last > latest => Refresh::Full,
                last => Refresh::Incremental(last.clone()),
            },
            None => Refresh::Full,
        };

        let state = match refresh {
            Refresh::Incremental(since) => {
                let events = self.read(since.as_ref()).await?;
                let mut state = cached
                    .clone()
                    .unwrap_or_else(|| TagState::empty(&self.id, entry.version));
                fold_until(&mut state, &entry, &events, &latest)?;
                state
            }
            Refresh::Full => {
                let events = self.read(None).await?;
                let mut state = TagState::empty(&self.id, entry.version);
                fold_until(&mut state, &entry, &events, &latest)?;
                state
            }
        };

        self.persistence.save(state.clone());
        *cached = Some(state.clone());
        Ok(state)
    }

    /// No read in flight.
    pub fn is_idle(&self) -> bool {
        self.cached.try_lock().is_ok()
    }

    /// Drop the cached and persisted state; the next read refolds from empty.
    pub async fn clear(&self) {
        let mut cached = self.cached.lock().await;
        *cached = None;
        self.persistence.clear(&self.id);
    }

    async fn read(&self, since: Option<&SortableUniqueId>) -> Result<Vec<Event>, TagStateError> {
        with_timeout(self.store_call_timeout, self.store.read_for_tag(&self.tag, since))
            .await
            .map_err(|err| {
                warn!(tag_state = %self.id, error = %err, "tag state refresh failed; keeping cache");
                TagStateError::Store(err)
            })
    }
}

fn fold_until(
    state: &mut TagState,
    entry: &ProjectorEntry,
    events: &[Event],
    latest: &SortableUniqueId,
) -> Result<(), TagStateError> {
    for event in events.iter().filter(|e| e.sortable_id <= *latest) {
        state.fold_event(entry.fold, event)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use dcbkit_core::{DomainResult, ManualClock};
    use dcbkit_events::TagProjector;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value as JsonValue, json};
    use uuid::Uuid;

    use crate::config::DcbConfig;
    use crate::event_store::InMemoryEventStore;
    use crate::read_model::InMemoryTagStateStore;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Enrollment {
        name: String,
        enrolled: bool,
    }

    struct EnrollmentProjector;

    impl TagProjector for EnrollmentProjector {
        const NAME: &'static str = "EnrollmentProjector";
        const VERSION: &'static str = "1";
        type State = Enrollment;

        fn project(mut state: Enrollment, event: &Event) -> DomainResult<Enrollment> {
            if event.is_type("StudentEnrolled") {
                state.name = event.payload["name"].as_str().unwrap_or_default().to_string();
                state.enrolled = true;
            }
            Ok(state)
        }
    }

    struct EnrollmentProjectorV2;

    impl TagProjector for EnrollmentProjectorV2 {
        const NAME: &'static str = "EnrollmentProjector";
        const VERSION: &'static str = "2";
        type State = Enrollment;

        fn project(state: Enrollment, event: &Event) -> DomainResult<Enrollment> {
            let mut state = EnrollmentProjector::project(state, event)?;
            state.name = state.name.to_uppercase();
            Ok(state)
        }
    }

    /// Store wrapper that counts tag reads and can be switched off.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryEventStore,
        down: AtomicBool,
        tag_reads: AtomicUsize,
        last_since: std::sync::Mutex<Option<Option<SortableUniqueId>>>,
    }

    impl CountingStore {
        fn check(&self) -> Result<(), EventStoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(EventStoreError::Unavailable("store down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EventStore for CountingStore {
        async fn append(&self, events: Vec<Event>) -> Result<Vec<Event>, EventStoreError> {
            self.inner.append(events).await
        }

        async fn read_for_tag(
            &self,
            tag: &Tag,
            since: Option<&SortableUniqueId>,
        ) -> Result<Vec<Event>, EventStoreError> {
            self.check()?;
            self.tag_reads.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_since.lock() {
                *last = Some(since.cloned());
            }
            self.inner.read_for_tag(tag, since).await
        }

        async fn read_all_since(
            &self,
            since: Option<&SortableUniqueId>,
            limit: Option<usize>,
        ) -> Result<Vec<Event>, EventStoreError> {
            self.check()?;
            self.inner.read_all_since(since, limit).await
        }

        async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableUniqueId>, EventStoreError> {
            self.check()?;
            self.inner.latest_for_tag(tag).await
        }
    }

    struct Fixture {
        store: Arc<CountingStore>,
        clock: Arc<ManualClock>,
        consistency: Arc<TagConsistency<Arc<CountingStore>, Arc<ManualClock>>>,
        persistence: Arc<InMemoryTagStateStore>,
    }

    fn student() -> Tag {
        Tag::consistency("Student", "123").unwrap()
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CountingStore::default());
        let clock = Arc::new(ManualClock::new(DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()));
        let consistency = Arc::new(TagConsistency::new(
            student(),
            store.clone(),
            clock.clone(),
            &DcbConfig::default(),
        ));
        Fixture {
            store,
            clock,
            consistency,
            persistence: Arc::new(InMemoryTagStateStore::new()),
        }
    }

    impl Fixture {
        fn cache(&self, registry: ProjectorRegistry) -> TagStateCache<Arc<CountingStore>, Arc<ManualClock>> {
            TagStateCache::new(
                EnrollmentProjector::NAME,
                self.consistency.clone(),
                self.store.clone(),
                Arc::new(registry),
                self.persistence.clone(),
                Duration::from_secs(1),
            )
        }

        /// Reserve, append and confirm one event.
        async fn write(&self, kind: &str, payload: JsonValue) -> SortableUniqueId {
            let observed = self.consistency.latest_committed_id().await.unwrap();
            let reservation = self.consistency.make_reservation(observed.as_ref()).await.unwrap();
            self.clock.advance(Duration::from_millis(5));
            let event = Event::new(
                SortableUniqueId::generate(self.clock.now(), Uuid::new_v4()),
                kind,
                vec![student()],
                payload,
            );
            let id = event.sortable_id.clone();
            self.store.append(vec![event]).await.unwrap();
            self.consistency.confirm_reservation(&reservation, &id).await.unwrap();
            id
        }
    }

    fn registry() -> ProjectorRegistry {
        ProjectorRegistry::new().with::<EnrollmentProjector>()
    }

    #[tokio::test]
    async fn empty_tag_yields_empty_state() {
        let fx = fixture();
        let state = fx.cache(registry()).get_tag_state().await.unwrap();
        assert_eq!(state.version, 0);
        assert!(state.payload.is_empty());
        assert_eq!(state.projector_version, "1");
    }

    #[tokio::test]
    async fn confirmed_write_is_reflected() {
        let fx = fixture();
        let cache = fx.cache(registry());
        let id = fx.write("StudentEnrolled", json!({"name": "Ada"})).await;

        let state = cache.get_tag_state().await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.last_sorted_unique_id, Some(id));
        let typed = state.decode::<EnrollmentProjector>().unwrap();
        assert!(typed.enrolled);
        assert_eq!(typed.name, "Ada");
    }

    #[tokio::test]
    async fn unchanged_tag_is_served_from_cache() {
        let fx = fixture();
        let cache = fx.cache(registry());
        fx.write("StudentEnrolled", json!({"name": "Ada"})).await;

        cache.get_tag_state().await.unwrap();
        let reads = fx.store.tag_reads.load(Ordering::SeqCst);
        cache.get_tag_state().await.unwrap();
        assert_eq!(fx.store.tag_reads.load(Ordering::SeqCst), reads);
    }

    #[tokio::test]
    async fn newer_writes_fold_incrementally() {
        let fx = fixture();
        let cache = fx.cache(registry());
        let first = fx.write("StudentEnrolled", json!({"name": "Ada"})).await;
        cache.get_tag_state().await.unwrap();

        fx.write("Noted", JsonValue::Null).await;
        let state = cache.get_tag_state().await.unwrap();

        assert_eq!(state.version, 2);
        let since = fx.store.last_since.lock().unwrap().clone();
        assert_eq!(since, Some(Some(first)));
    }

    #[tokio::test]
    async fn unconfirmed_events_stay_invisible() {
        let fx = fixture();
        let cache = fx.cache(registry());
        fx.write("StudentEnrolled", json!({"name": "Ada"})).await;

        let observed = fx.consistency.latest_committed_id().await.unwrap();
        let _pending = fx.consistency.make_reservation(observed.as_ref()).await.unwrap();
        fx.clock.advance(Duration::from_millis(5));
        let tentative = Event::new(
            SortableUniqueId::generate(fx.clock.now(), Uuid::new_v4()),
            "Noted",
            vec![student()],
            JsonValue::Null,
        );
        fx.store.append(vec![tentative]).await.unwrap();

        assert_eq!(cache.get_tag_state().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn projector_version_bump_forces_full_refold() {
        let fx = fixture();
        fx.write("StudentEnrolled", json!({"name": "Ada"})).await;
        fx.cache(registry()).get_tag_state().await.unwrap();

        let upgraded = fx.cache(ProjectorRegistry::new().with::<EnrollmentProjectorV2>());
        let state = upgraded.get_tag_state().await.unwrap();

        assert_eq!(state.projector_version, "2");
        assert_eq!(state.version, 1);
        assert_eq!(state.decode::<EnrollmentProjectorV2>().unwrap().name, "ADA");
        let since = fx.store.last_since.lock().unwrap().clone();
        assert_eq!(since, Some(None));
    }

    #[tokio::test]
    async fn store_outage_keeps_cache_and_is_retryable() {
        let fx = fixture();
        let cache = fx.cache(registry());
        fx.write("StudentEnrolled", json!({"name": "Ada"})).await;
        let before = cache.get_tag_state().await.unwrap();

        fx.write("Noted", JsonValue::Null).await;
        fx.store.down.store(true, Ordering::SeqCst);
        let err = cache.get_tag_state().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fx.persistence.load(cache.id()), Some(before));

        fx.store.down.store(false, Ordering::SeqCst);
        assert_eq!(cache.get_tag_state().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn queued_reader_sees_writes_confirmed_while_waiting() {
        let fx = fixture();
        let cache = Arc::new(fx.cache(registry()));
        fx.write("StudentEnrolled", json!({"name": "Ada"})).await;
        cache.get_tag_state().await.unwrap();

        let busy = cache.cached.lock().await;
        let reader = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_tag_state().await }
        });
        tokio::task::yield_now().await;
        let second = fx.write("Noted", JsonValue::Null).await;
        drop(busy);

        let state = reader.await.unwrap().unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.last_sorted_unique_id, Some(second.clone()));
        let saved = fx.persistence.load(cache.id()).unwrap();
        assert_eq!(saved.last_sorted_unique_id, Some(second));
    }

    #[tokio::test]
    async fn unknown_projector_is_reported() {
        let fx = fixture();
        let err = fx.cache(ProjectorRegistry::new()).get_tag_state().await.unwrap_err();
        assert_eq!(err, TagStateError::ProjectorNotFound("EnrollmentProjector".into()));
    }

    #[tokio::test]
    async fn clear_forces_refold() {
        let fx = fixture();
        let cache = fx.cache(registry());
        fx.write("StudentEnrolled", json!({"name": "Ada"})).await;
        cache.get_tag_state().await.unwrap();

        cache.clear().await;
        assert!(fx.persistence.load(cache.id()).is_none());
        assert_eq!(cache.get_tag_state().await.unwrap().version, 1);
        let since = fx.store.last_since.lock().unwrap().clone();
        assert_eq!(since, Some(None));
    }
}
