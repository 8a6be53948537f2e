use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dcbkit_core::TagStateId;
use dcbkit_events::TagState;

/// Key/value store for materialized tag states.
///
/// States are disposable: losing one only costs a refold from the event store.
pub trait TagStateStore: Send + Sync {
    fn load(&self, id: &TagStateId) -> Option<TagState>;
    fn save(&self, state: TagState);
    fn list(&self) -> Vec<TagState>;
    fn clear(&self, id: &TagStateId);
}

impl<S> TagStateStore for Arc<S>
where
    S: TagStateStore + ?Sized,
{
    fn load(&self, id: &TagStateId) -> Option<TagState> {
        (**self).load(id)
    }

    fn save(&self, state: TagState) {
        (**self).save(state)
    }

    fn list(&self) -> Vec<TagState> {
        (**self).list()
    }

    fn clear(&self, id: &TagStateId) {
        (**self).clear(id)
    }
}

/// In-memory tag-state store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTagStateStore {
    inner: RwLock<HashMap<TagStateId, TagState>>,
}

impl InMemoryTagStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagStateStore for InMemoryTagStateStore {
    fn load(&self, id: &TagStateId) -> Option<TagState> {
        let map = self.inner.read().ok()?;
        map.get(id).cloned()
    }

    fn save(&self, state: TagState) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(state.id(), state);
        }
    }

    fn list(&self) -> Vec<TagState> {
        match self.inner.read() {
            Ok(map) => {
                let mut states: Vec<_> = map.values().cloned().collect();
                states.sort_by_key(TagState::id);
                states
            }
            Err(_) => vec![],
        }
    }

    fn clear(&self, id: &TagStateId) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(id);
        }
    }
}
