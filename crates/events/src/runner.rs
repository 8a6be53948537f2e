//! Projection runner for multi-tag projections.
//!
//! Read models are **disposable**; events are the source of truth. The runner
//! owns one [`GenericTagMultiProjector`], derives the safe-window threshold
//! from a [`Clock`] for every call and tracks progress.

use std::collections::HashMap;
use std::time::Duration;

use dcbkit_core::{Clock, DomainResult, SortableUniqueId, TagStateId};

use crate::{Event, GenericTagMultiProjector, TagProjector, TagState};

/// Progress of a runner.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProjectionCursor {
    processed_events: u64,
    last_sortable_id: Option<SortableUniqueId>,
}

impl ProjectionCursor {
    /// Number of deliveries handed to the projector (duplicates included).
    pub fn processed_events(&self) -> u64 {
        self.processed_events
    }

    /// Highest event id delivered so far.
    pub fn last_sortable_id(&self) -> Option<&SortableUniqueId> {
        self.last_sortable_id.as_ref()
    }
}

/// Runs events through a multi-tag projector under a safe window.
pub struct MultiProjectionRunner<P, C>
where
    P: TagProjector,
    C: Clock,
{
    projector: GenericTagMultiProjector<P>,
    safe_window: Duration,
    clock: C,
    cursor: ProjectionCursor,
}

impl<P, C> MultiProjectionRunner<P, C>
where
    P: TagProjector,
    C: Clock,
{
    pub fn new(projector: GenericTagMultiProjector<P>, safe_window: Duration, clock: C) -> Self {
        Self {
            projector,
            safe_window,
            clock,
            cursor: ProjectionCursor::default(),
        }
    }

    pub fn projector(&self) -> &GenericTagMultiProjector<P> {
        &self.projector
    }

    pub fn into_projector(self) -> GenericTagMultiProjector<P> {
        self.projector
    }

    pub fn cursor(&self) -> &ProjectionCursor {
        &self.cursor
    }

    pub fn safe_window(&self) -> Duration {
        self.safe_window
    }

    /// Threshold id for "now minus the safe window".
    pub fn threshold(&self) -> SortableUniqueId {
        SortableUniqueId::safe_window_threshold(self.clock.now(), self.safe_window)
    }

    pub fn apply(&mut self, event: &Event) -> DomainResult<()> {
        let threshold = self.threshold();
        self.projector.process_event(event, &threshold)?;

        self.cursor.processed_events += 1;
        if self
            .cursor
            .last_sortable_id
            .as_ref()
            .is_none_or(|last| event.sortable_id > *last)
        {
            self.cursor.last_sortable_id = Some(event.sortable_id.clone());
        }
        Ok(())
    }

    /// Apply many events in delivery order.
    pub fn run<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> DomainResult<()> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Promote buffered events that aged past the safe window.
    pub fn tick(&mut self) -> DomainResult<()> {
        let threshold = self.threshold();
        self.projector.promote(&threshold)
    }

    pub fn current_tag_states(&self) -> &HashMap<TagStateId, TagState> {
        self.projector.current_tag_states()
    }

    pub fn safe_tag_states(&self) -> DomainResult<HashMap<TagStateId, TagState>> {
        self.projector.safe_tag_states(&self.threshold())
    }

    pub fn state_payloads(&self) -> DomainResult<Vec<P::State>> {
        self.projector.state_payloads()
    }

    pub fn safe_state_payloads(&self) -> DomainResult<Vec<P::State>> {
        self.projector.safe_state_payloads(&self.threshold())
    }

    pub fn is_tag_state_unsafe(&self, id: &TagStateId) -> bool {
        self.projector.is_tag_state_unsafe(id)
    }

    /// Compact snapshot of the safe view at the current threshold.
    pub fn snapshot(&self) -> DomainResult<Vec<u8>> {
        self.projector.serialize(&self.threshold())
    }

    /// Rebuild a projector from scratch by replaying history.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> GenericTagMultiProjector<P>,
        safe_window: Duration,
        clock: C,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> DomainResult<Self> {
        let mut runner = Self::new(factory(), safe_window, clock);
        runner.run(events)?;
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use dcbkit_core::{ManualClock, Tag};
    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Seen {
        kinds: Vec<String>,
    }

    struct SeenProjector;

    impl TagProjector for SeenProjector {
        const NAME: &'static str = "SeenProjector";
        const VERSION: &'static str = "1";
        type State = Seen;

        fn project(mut state: Seen, event: &Event) -> DomainResult<Seen> {
            state.kinds.push(event.event_type.clone());
            Ok(state)
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn event_at(at: DateTime<Utc>, kind: &str) -> Event {
        Event::new(
            SortableUniqueId::generate(at, Uuid::new_v4()),
            kind,
            vec![Tag::consistency("Doc", "d1").unwrap()],
            JsonValue::Null,
        )
    }

    fn runner(clock: Arc<ManualClock>) -> MultiProjectionRunner<SeenProjector, Arc<ManualClock>> {
        MultiProjectionRunner::new(
            GenericTagMultiProjector::new("Doc"),
            Duration::from_secs(20),
            clock,
        )
    }

    #[test]
    fn safe_view_follows_clock() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut r = runner(clock.clone());

        let late = event_at(start() - chrono::Duration::seconds(2), "Second");
        let early = event_at(start() - chrono::Duration::seconds(4), "First");
        r.apply(&late).unwrap();
        r.apply(&early).unwrap();

        assert!(r.safe_state_payloads().unwrap().is_empty());
        assert_eq!(r.state_payloads().unwrap()[0].kinds, vec!["Second", "First"]);

        clock.advance(Duration::from_secs(30));
        r.tick().unwrap();
        assert_eq!(r.safe_state_payloads().unwrap()[0].kinds, vec!["First", "Second"]);
        assert_eq!(r.state_payloads().unwrap()[0].kinds, vec!["First", "Second"]);
    }

    #[test]
    fn cursor_tracks_highest_id() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut r = runner(clock);
        let a = event_at(start() - chrono::Duration::seconds(50), "A");
        let b = event_at(start() - chrono::Duration::seconds(60), "B");

        r.run([&a, &b]).unwrap();
        assert_eq!(r.cursor().processed_events(), 2);
        assert_eq!(r.cursor().last_sortable_id(), Some(&a.sortable_id));
    }

    #[test]
    fn rebuild_replays_history() {
        let clock = Arc::new(ManualClock::new(start()));
        let events = vec![
            event_at(start() - chrono::Duration::seconds(90), "A"),
            event_at(start() - chrono::Duration::seconds(80), "B"),
        ];
        let r = MultiProjectionRunner::<SeenProjector, _>::rebuild_from_scratch(
            || GenericTagMultiProjector::new("Doc"),
            Duration::from_secs(20),
            clock,
            &events,
        )
        .unwrap();
        assert_eq!(r.safe_state_payloads().unwrap()[0].kinds, vec!["A", "B"]);
        assert!(!r.snapshot().unwrap().is_empty());
    }
}
