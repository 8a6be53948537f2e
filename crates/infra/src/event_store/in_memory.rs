use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use dcbkit_core::{EventId, SortableUniqueId, Tag};
use dcbkit_events::Event;

use super::r#trait::{EventStore, EventStoreError};

#[derive(Debug, Default)]
struct Log {
    events: BTreeMap<SortableUniqueId, Event>,
    by_id: HashMap<EventId, SortableUniqueId>,
    by_tag: HashMap<Tag, BTreeSet<SortableUniqueId>>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<Event>) -> Result<Vec<Event>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut log = self.log.write().map_err(|_| poisoned())?;

        // Validate the whole batch before touching the log.
        let mut fresh = Vec::with_capacity(events.len());
        let mut batch_ids = HashMap::with_capacity(events.len());
        for (idx, e) in events.iter().enumerate() {
            if let Some(existing_id) = log.by_id.get(&e.id) {
                let stored = log.events.get(existing_id);
                if stored != Some(e) {
                    return Err(EventStoreError::DuplicateEvent(e.id));
                }
                continue;
            }
            if let Some(other) = batch_ids.insert(e.id, idx) {
                if events[other] != *e {
                    return Err(EventStoreError::DuplicateEvent(e.id));
                }
                continue;
            }
            if log.events.contains_key(&e.sortable_id)
                || fresh.iter().any(|f: &&Event| f.sortable_id == e.sortable_id)
            {
                return Err(EventStoreError::InvalidAppend(format!(
                    "sortable id {} already used (index {idx})",
                    e.sortable_id
                )));
            }
            fresh.push(e);
        }

        for e in fresh {
            log.by_id.insert(e.id, e.sortable_id.clone());
            for tag in &e.tags {
                log.by_tag
                    .entry(tag.clone())
                    .or_default()
                    .insert(e.sortable_id.clone());
            }
            log.events.insert(e.sortable_id.clone(), e.clone());
        }

        Ok(events)
    }

    async fn read_for_tag(
        &self,
        tag: &Tag,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        let Some(ids) = log.by_tag.get(tag) else {
            return Ok(vec![]);
        };

        Ok(ids
            .iter()
            .filter(|id| since.is_none_or(|s| *id > s))
            .filter_map(|id| log.events.get(id).cloned())
            .collect())
    }

    async fn read_all_since(
        &self,
        since: Option<&SortableUniqueId>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        Ok(log
            .events
            .iter()
            .filter(|(id, _)| since.is_none_or(|s| *id > s))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn latest_for_tag(&self, tag: &Tag) -> Result<Option<SortableUniqueId>, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        Ok(log.by_tag.get(tag).and_then(|ids| ids.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;

    fn tag(content: &str) -> Tag {
        Tag::consistency("Student", content).unwrap()
    }

    fn event(content: &str) -> Event {
        Event::new(SortableUniqueId::generate_new(), "Touched", vec![tag(content)], JsonValue::Null)
    }

    #[tokio::test]
    async fn reads_are_ordered_and_scoped_by_tag() {
        let store = InMemoryEventStore::new();
        let a1 = event("a");
        let b1 = event("b");
        let a2 = event("a");
        store.append(vec![a2.clone(), a1.clone(), b1.clone()]).await.unwrap();

        let a = store.read_for_tag(&tag("a"), None).await.unwrap();
        let mut expected = vec![a1.clone(), a2.clone()];
        expected.sort_by(|x, y| x.sortable_id.cmp(&y.sortable_id));
        assert_eq!(a, expected);

        let latest = store.latest_for_tag(&tag("a")).await.unwrap();
        assert_eq!(latest.as_ref(), Some(&expected[1].sortable_id));

        let after_first = store
            .read_for_tag(&tag("a"), Some(&expected[0].sortable_id))
            .await
            .unwrap();
        assert_eq!(after_first, vec![expected[1].clone()]);
        assert_eq!(store.latest_for_tag(&tag("zzz")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reappending_the_same_event_is_idempotent() {
        let store = InMemoryEventStore::new();
        let e = event("a");
        store.append(vec![e.clone()]).await.unwrap();
        store.append(vec![e.clone(), e.clone()]).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn reusing_an_id_for_other_content_is_rejected() {
        let store = InMemoryEventStore::new();
        let e = event("a");
        store.append(vec![e.clone()]).await.unwrap();

        let mut forged = event("b");
        forged.id = e.id;
        let err = store.append(vec![forged]).await.unwrap_err();
        assert_eq!(err, EventStoreError::DuplicateEvent(e.id));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn failed_batch_stores_nothing() {
        let store = InMemoryEventStore::new();
        let first = event("a");
        let mut clash = event("b");
        clash.sortable_id = first.sortable_id.clone();

        assert!(store.append(vec![first, clash]).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn catch_up_reads_respect_cursor_and_limit() {
        let store = InMemoryEventStore::new();
        let events: Vec<_> = (0..5).map(|i| event(&i.to_string())).collect();
        store.append(events.clone()).await.unwrap();

        let mut sorted = events;
        sorted.sort_by(|x, y| x.sortable_id.cmp(&y.sortable_id));

        let page = store.read_all_since(None, Some(2)).await.unwrap();
        assert_eq!(page, sorted[..2].to_vec());

        let rest = store
            .read_all_since(Some(&sorted[1].sortable_id), None)
            .await
            .unwrap();
        assert_eq!(rest, sorted[2..].to_vec());
    }
}
