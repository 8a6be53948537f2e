//! Projector registry: explicit startup registration of tag projectors.

use std::collections::HashMap;

use tracing::warn;

use dcbkit_events::{PayloadFold, TagProjector, fold_payload};

/// A registered projector, resolved by name.
#[derive(Debug, Clone, Copy)]
pub struct ProjectorEntry {
    pub name: &'static str,
    pub version: &'static str,
    pub fold: PayloadFold,
}

/// Name → `{version, fold}` table used by tag-state caches.
#[derive(Debug, Default, Clone)]
pub struct ProjectorRegistry {
    entries: HashMap<&'static str, ProjectorEntry>,
}

impl ProjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P`; a second registration under the same name replaces the first.
    pub fn register<P: TagProjector>(&mut self) -> &mut Self {
        let entry = ProjectorEntry {
            name: P::NAME,
            version: P::VERSION,
            fold: fold_payload::<P>,
        };
        if let Some(previous) = self.entries.insert(P::NAME, entry) {
            warn!(
                projector = P::NAME,
                previous_version = previous.version,
                version = P::VERSION,
                "projector registered twice; keeping the latest"
            );
        }
        self
    }

    pub fn with<P: TagProjector>(mut self) -> Self {
        self.register::<P>();
        self
    }

    pub fn get(&self, name: &str) -> Option<&ProjectorEntry> {
        self.entries.get(name)
    }

    /// Entry for `name` only if its version is `version`.
    pub fn resolve(&self, name: &str, version: &str) -> Option<&ProjectorEntry> {
        self.get(name).filter(|entry| entry.version == version)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcbkit_core::{DomainResult, SortableUniqueId, Tag};
    use dcbkit_events::{Event, TagStatePayload};
    use serde_json::Value as JsonValue;

    struct CountV1;
    struct CountV2;

    impl TagProjector for CountV1 {
        const NAME: &'static str = "Count";
        const VERSION: &'static str = "1";
        type State = u32;

        fn project(state: u32, _event: &Event) -> DomainResult<u32> {
            Ok(state + 1)
        }
    }

    impl TagProjector for CountV2 {
        const NAME: &'static str = "Count";
        const VERSION: &'static str = "2";
        type State = u32;

        fn project(state: u32, _event: &Event) -> DomainResult<u32> {
            Ok(state + 2)
        }
    }

    #[test]
    fn resolves_by_name_and_version() {
        let registry = ProjectorRegistry::new().with::<CountV1>();
        assert!(registry.resolve("Count", "1").is_some());
        assert!(registry.resolve("Count", "2").is_none());
        assert!(registry.get("Missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Count"]);
    }

    #[test]
    fn reregistration_replaces_the_fold() {
        let registry = ProjectorRegistry::new().with::<CountV1>().with::<CountV2>();
        assert_eq!(registry.len(), 1);

        let entry = registry.get("Count").unwrap();
        let event = Event::new(
            SortableUniqueId::generate_new(),
            "Any",
            vec![Tag::consistency("C", "1").unwrap()],
            JsonValue::Null,
        );
        let folded = (entry.fold)(&TagStatePayload::Empty, &event).unwrap();
        assert_eq!(folded.decode::<CountV2>().unwrap(), 2);
    }
}
