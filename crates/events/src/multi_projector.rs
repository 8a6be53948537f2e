//! Multi-tag projection over every tag of one group.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use dcbkit_core::{DomainError, DomainResult, SortableUniqueId, TagStateId};

use crate::safe_unsafe::{ItemFold, SafeUnsafeProjectionState};
use crate::{Event, TagProjector, TagState, TagStatePayload};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Folds every tag of `tag_group` through projector `P`.
///
/// Backed by a [`SafeUnsafeProjectionState`] keyed by [`TagStateId`], so list
/// queries can choose between the fast current view and the deterministic safe
/// view. Tags whose state reports `P::is_deleted` disappear from both views.
pub struct GenericTagMultiProjector<P: TagProjector> {
    tag_group: String,
    state: SafeUnsafeProjectionState<TagStateId, TagState>,
    /// Events at or below this id are already part of a restored snapshot.
    restored_through: Option<SortableUniqueId>,
    _projector: PhantomData<P>,
}

// Derived impls would bound `P: Clone + Debug`; projectors are usually bare
// marker types.
impl<P: TagProjector> Clone for GenericTagMultiProjector<P> {
    fn clone(&self) -> Self {
        Self {
            tag_group: self.tag_group.clone(),
            state: self.state.clone(),
            restored_through: self.restored_through.clone(),
            _projector: PhantomData,
        }
    }
}

impl<P: TagProjector> fmt::Debug for GenericTagMultiProjector<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericTagMultiProjector")
            .field("projector", &P::NAME)
            .field("tag_group", &self.tag_group)
            .field("state", &self.state)
            .field("restored_through", &self.restored_through)
            .finish()
    }
}

struct TagFold<'a, P> {
    tag_group: &'a str,
    _projector: PhantomData<P>,
}

impl<P: TagProjector> ItemFold<TagStateId, TagState> for TagFold<'_, P> {
    type Error = DomainError;

    fn affected_keys(&self, event: &Event) -> Vec<TagStateId> {
        event
            .tags
            .iter()
            .filter(|tag| tag.group() == self.tag_group)
            .map(|tag| TagStateId::new(tag, P::NAME))
            .collect()
    }

    fn fold_item(
        &self,
        key: &TagStateId,
        current: Option<TagState>,
        event: &Event,
    ) -> DomainResult<Option<TagState>> {
        let mut state = current.unwrap_or_else(|| TagState::empty(key, P::VERSION));
        let typed = state.apply::<P>(event)?;
        if P::is_deleted(&typed) {
            return Ok(None);
        }
        Ok(Some(state))
    }
}

impl<P: TagProjector> GenericTagMultiProjector<P> {
    pub fn new(tag_group: impl Into<String>) -> Self {
        Self {
            tag_group: tag_group.into(),
            state: SafeUnsafeProjectionState::new(),
            restored_through: None,
            _projector: PhantomData,
        }
    }

    /// Projection name, unique per `(projector, tag group)`.
    pub fn name(&self) -> String {
        format!("GenericTagMultiProjector_{}_{}", P::NAME, self.tag_group)
    }

    pub fn tag_group(&self) -> &str {
        &self.tag_group
    }

    fn fold(&self) -> TagFold<'_, P> {
        TagFold {
            tag_group: &self.tag_group,
            _projector: PhantomData,
        }
    }

    pub fn process_event(&mut self, event: &Event, threshold: &SortableUniqueId) -> DomainResult<()> {
        if let Some(restored) = &self.restored_through {
            if event.sortable_id <= *restored {
                return Ok(());
            }
        }
        let fold = TagFold::<P> {
            tag_group: &self.tag_group,
            _projector: PhantomData,
        };
        self.state.process_event(event, &fold, threshold)
    }

    /// Promote buffered events without delivering a new one (time moved on).
    pub fn promote(&mut self, threshold: &SortableUniqueId) -> DomainResult<()> {
        let fold = TagFold::<P> {
            tag_group: &self.tag_group,
            _projector: PhantomData,
        };
        self.state.promote_safe_events(threshold, &fold)
    }

    pub fn current_tag_states(&self) -> &HashMap<TagStateId, TagState> {
        self.state.current_state()
    }

    pub fn safe_tag_states(&self, threshold: &SortableUniqueId) -> DomainResult<HashMap<TagStateId, TagState>> {
        self.state.get_safe_state(threshold, &self.fold())
    }

    /// Decoded payloads of the current view, ordered by tag state id.
    pub fn state_payloads(&self) -> DomainResult<Vec<P::State>> {
        decode_sorted::<P>(self.state.current_state().iter())
    }

    /// Decoded payloads of the safe view at `threshold`, ordered by tag state id.
    pub fn safe_state_payloads(&self, threshold: &SortableUniqueId) -> DomainResult<Vec<P::State>> {
        let safe = self.safe_tag_states(threshold)?;
        decode_sorted::<P>(safe.iter())
    }

    pub fn is_tag_state_unsafe(&self, id: &TagStateId) -> bool {
        self.state.is_item_unsafe(id)
    }

    /// Compact snapshot of the safe view at `threshold`.
    ///
    /// Layout: `{"v":1,"p":name,"pv":version,"g":group,"t":threshold,"items":[..]}`
    /// with one `{"c","t","d","n","l"}` entry (content, payload type, payload
    /// data, version, last id) per tag, sorted by content.
    pub fn serialize(&self, threshold: &SortableUniqueId) -> DomainResult<Vec<u8>> {
        let safe = self.safe_tag_states(threshold)?;
        let mut items: Vec<CompactItem> = safe
            .into_values()
            .map(|state| {
                let (payload_type, data) = match state.payload {
                    TagStatePayload::Empty => (None, JsonValue::Null),
                    TagStatePayload::State { type_name, data } => (Some(type_name), data),
                };
                CompactItem {
                    content: state.tag_content,
                    payload_type,
                    data,
                    version: state.version,
                    last: state.last_sorted_unique_id,
                }
            })
            .collect();
        items.sort_by(|a, b| a.content.cmp(&b.content));

        let snapshot = CompactSnapshot {
            format: SNAPSHOT_FORMAT_VERSION,
            projector: P::NAME.to_string(),
            projector_version: P::VERSION.to_string(),
            tag_group: self.tag_group.clone(),
            threshold: Some(threshold.clone()),
            items,
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    /// Restore from [`serialize`](Self::serialize) output.
    ///
    /// Snapshots written by another projector or projector version are
    /// rejected; the caller rebuilds from events instead.
    pub fn deserialize(bytes: &[u8]) -> DomainResult<Self> {
        let snapshot: CompactSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.format != SNAPSHOT_FORMAT_VERSION {
            return Err(DomainError::validation(format!(
                "unsupported multi-projector snapshot format {}",
                snapshot.format
            )));
        }
        if snapshot.projector != P::NAME || snapshot.projector_version != P::VERSION {
            return Err(DomainError::validation(format!(
                "snapshot built by {}@{}, expected {}@{}",
                snapshot.projector,
                snapshot.projector_version,
                P::NAME,
                P::VERSION
            )));
        }

        let mut current = HashMap::with_capacity(snapshot.items.len());
        for item in snapshot.items {
            let payload = match item.payload_type {
                None => TagStatePayload::Empty,
                Some(type_name) => TagStatePayload::State {
                    type_name,
                    data: item.data,
                },
            };
            let state = TagState {
                payload,
                version: item.version,
                last_sorted_unique_id: item.last,
                tag_group: snapshot.tag_group.clone(),
                tag_content: item.content,
                projector_name: snapshot.projector.clone(),
                projector_version: snapshot.projector_version.clone(),
            };
            current.insert(state.id(), state);
        }

        debug!(
            projector = P::NAME,
            tag_group = %snapshot.tag_group,
            items = current.len(),
            "restored multi-projector snapshot"
        );
        Ok(Self {
            tag_group: snapshot.tag_group,
            state: SafeUnsafeProjectionState::from_current(current),
            restored_through: snapshot.threshold,
            _projector: PhantomData,
        })
    }
}

fn decode_sorted<'a, P: TagProjector>(
    states: impl Iterator<Item = (&'a TagStateId, &'a TagState)>,
) -> DomainResult<Vec<P::State>> {
    let mut states: Vec<_> = states.collect();
    states.sort_by(|a, b| a.0.cmp(b.0));
    states.into_iter().map(|(_, s)| s.decode::<P>()).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct CompactSnapshot {
    #[serde(rename = "v")]
    format: u32,
    #[serde(rename = "p")]
    projector: String,
    #[serde(rename = "pv")]
    projector_version: String,
    #[serde(rename = "g")]
    tag_group: String,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    threshold: Option<SortableUniqueId>,
    items: Vec<CompactItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompactItem {
    #[serde(rename = "c")]
    content: String,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    payload_type: Option<String>,
    #[serde(rename = "d", default)]
    data: JsonValue,
    #[serde(rename = "n")]
    version: u64,
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    last: Option<SortableUniqueId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use dcbkit_core::Tag;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Student {
        name: String,
        courses: Vec<String>,
        withdrawn: bool,
    }

    struct StudentProjector;

    impl TagProjector for StudentProjector {
        const NAME: &'static str = "StudentProjector";
        const VERSION: &'static str = "1.0.0";
        type State = Student;

        fn project(mut state: Student, event: &Event) -> DomainResult<Student> {
            match event.event_type.as_str() {
                "StudentEnrolled" => {
                    state.name = event.payload["name"].as_str().unwrap_or_default().to_string();
                }
                "CourseAdded" => {
                    let course = event.payload["course"].as_str().unwrap_or_default();
                    state.courses.push(course.to_string());
                }
                "StudentWithdrawn" => state.withdrawn = true,
                _ => {}
            }
            Ok(state)
        }

        fn is_deleted(state: &Student) -> bool {
            state.withdrawn
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn threshold() -> SortableUniqueId {
        SortableUniqueId::safe_window_threshold(now(), std::time::Duration::from_secs(20))
    }

    fn event(secs_ago: i64, kind: &str, student: &str, payload: JsonValue) -> Event {
        let id = SortableUniqueId::generate(now() - Duration::seconds(secs_ago), Uuid::new_v4());
        Event::new(id, kind, vec![Tag::consistency("Student", student).unwrap()], payload)
    }

    fn sid(student: &str) -> TagStateId {
        TagStateId::new(&Tag::consistency("Student", student).unwrap(), StudentProjector::NAME)
    }

    #[test]
    fn folds_each_tag_of_the_group() {
        let mut p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let t = threshold();
        p.process_event(&event(60, "StudentEnrolled", "1", json!({"name": "Ada"})), &t).unwrap();
        p.process_event(&event(50, "StudentEnrolled", "2", json!({"name": "Alan"})), &t).unwrap();
        p.process_event(&event(40, "CourseAdded", "1", json!({"course": "Math"})), &t).unwrap();

        let states = p.current_tag_states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[&sid("1")].version, 2);

        let payloads = p.state_payloads().unwrap();
        assert_eq!(payloads[0].name, "Ada");
        assert_eq!(payloads[0].courses, vec!["Math"]);
        assert_eq!(payloads[1].name, "Alan");
        assert_eq!(p.name(), "GenericTagMultiProjector_StudentProjector_Student");
    }

    #[test]
    fn ignores_tags_of_other_groups() {
        let mut p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let e = Event::new(
            SortableUniqueId::generate(now() - Duration::seconds(60), Uuid::new_v4()),
            "StudentEnrolled",
            vec![Tag::consistency("Instructor", "9").unwrap()],
            json!({"name": "Grace"}),
        );
        p.process_event(&e, &threshold()).unwrap();
        assert!(p.current_tag_states().is_empty());
    }

    #[test]
    fn recent_events_mark_tag_unsafe_until_promoted() {
        let mut p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let t = threshold();
        p.process_event(&event(60, "StudentEnrolled", "1", json!({"name": "Ada"})), &t).unwrap();
        p.process_event(&event(5, "CourseAdded", "1", json!({"course": "Art"})), &t).unwrap();

        assert!(p.is_tag_state_unsafe(&sid("1")));
        assert_eq!(p.state_payloads().unwrap()[0].courses, vec!["Art"]);
        assert!(p.safe_state_payloads(&t).unwrap()[0].courses.is_empty());

        p.promote(&SortableUniqueId::threshold(now())).unwrap();
        assert!(!p.is_tag_state_unsafe(&sid("1")));
    }

    #[test]
    fn deleted_state_drops_tag_from_views() {
        let mut p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let t = threshold();
        p.process_event(&event(60, "StudentEnrolled", "1", json!({"name": "Ada"})), &t).unwrap();
        p.process_event(&event(50, "StudentWithdrawn", "1", JsonValue::Null), &t).unwrap();
        assert!(p.current_tag_states().is_empty());
        assert!(p.state_payloads().unwrap().is_empty());
    }

    #[test]
    fn snapshot_round_trip_preserves_safe_states() {
        let mut p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let t = threshold();
        p.process_event(&event(60, "StudentEnrolled", "1", json!({"name": "Ada"})), &t).unwrap();
        p.process_event(&event(55, "StudentEnrolled", "2", json!({"name": "Alan"})), &t).unwrap();
        p.process_event(&event(3, "CourseAdded", "2", json!({"course": "Logic"})), &t).unwrap();

        let bytes = p.serialize(&t).unwrap();
        let restored = GenericTagMultiProjector::<StudentProjector>::deserialize(&bytes).unwrap();

        assert_eq!(restored.current_tag_states(), &p.safe_tag_states(&t).unwrap());
        assert_eq!(restored.tag_group(), "Student");
        assert_eq!(restored.serialize(&t).unwrap(), bytes);
    }

    #[test]
    fn restored_projector_skips_events_already_in_snapshot() {
        let mut p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let t = threshold();
        let enrolled = event(60, "StudentEnrolled", "1", json!({"name": "Ada"}));
        p.process_event(&enrolled, &t).unwrap();

        let mut restored =
            GenericTagMultiProjector::<StudentProjector>::deserialize(&p.serialize(&t).unwrap()).unwrap();
        restored.process_event(&enrolled, &t).unwrap();
        restored
            .process_event(&event(2, "CourseAdded", "1", json!({"course": "Math"})), &t)
            .unwrap();

        assert_eq!(restored.current_tag_states()[&sid("1")].version, 2);
    }

    #[test]
    fn clones_and_formats_for_marker_projectors() {
        let mut p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let t = threshold();
        p.process_event(&event(60, "StudentEnrolled", "1", json!({"name": "Ada"})), &t).unwrap();

        let copy = p.clone();
        p.process_event(&event(50, "CourseAdded", "1", json!({"course": "Math"})), &t).unwrap();
        assert_eq!(copy.current_tag_states()[&sid("1")].version, 1);
        assert_eq!(p.current_tag_states()[&sid("1")].version, 2);

        let shown = format!("{copy:?}");
        assert!(shown.starts_with("GenericTagMultiProjector"));
        assert!(shown.contains("StudentProjector"));
    }

    #[test]
    fn snapshot_of_other_projector_version_is_rejected() {
        let p = GenericTagMultiProjector::<StudentProjector>::new("Student");
        let bytes = p.serialize(&threshold()).unwrap();
        let mut doc: JsonValue = serde_json::from_slice(&bytes).unwrap();
        doc["pv"] = json!("2.0.0");
        let tampered = serde_json::to_vec(&doc).unwrap();

        let err = GenericTagMultiProjector::<StudentProjector>::deserialize(&tampered).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
