//! Known-object views of last-observed resource state.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::event::{Event, EventKind};

/// A read-only view over the last-observed state of resources, keyed the
/// same way the cache keys its queues.
///
/// The view is externally owned; the cache only ever reads it, during
/// replace (to detect deletions) and synchronize (to emit resync events).
/// Snapshots must be atomic with respect to concurrent writers:
/// implementations hold their own lock for the duration of the call.
pub trait KnownObjects<T>: Send + Sync {
    /// Capture the current `(key, resource)` pairs.
    fn snapshot(&self) -> Vec<(String, T)>;
}

/// A shared, lock-protected map of last-observed resources.
///
/// Typically maintained by the consumer as it drains queues (see
/// [`MemoryStore::apply`]) and handed to the cache as its known-objects
/// view.
#[derive(Debug)]
pub struct MemoryStore<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> MemoryStore<T> {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record `resource` under `key`, returning the previous state if any.
    pub fn insert(&self, key: String, resource: T) -> Option<T> {
        self.write().insert(key, resource)
    }

    /// Forget the resource under `key`, returning it if it was present.
    pub fn remove(&self, key: &str) -> Option<T> {
        self.write().remove(key)
    }

    /// The number of resources currently known.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no resources are known.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, T>> {
        self.entries.read().expect("known objects lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, T>> {
        self.entries.write().expect("known objects lock poisoned")
    }
}

impl<T> MemoryStore<T>
where
    T: Clone,
{
    /// The last-observed state of the resource under `key`, if any.
    pub fn get(&self, key: &str) -> Option<T> {
        self.read().get(key).cloned()
    }

    /// Fold a drained event into the view: a deletion forgets the key,
    /// anything else records the event's payload as the latest state.
    pub fn apply(&self, event: &Event<T>) {
        match event.kind() {
            EventKind::Deletion => {
                self.remove(event.key());
            }
            EventKind::Addition | EventKind::Modification => {
                self.insert(event.key().to_owned(), event.resource().clone());
            }
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> KnownObjects<T> for MemoryStore<T>
where
    T: Clone + Send + Sync,
{
    fn snapshot(&self) -> Vec<(String, T)> {
        self.read()
            .iter()
            .map(|(key, resource)| (key.clone(), resource.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Source;

    const TEST_SOURCE: Source = Source::new("test");

    #[test]
    fn insert_and_snapshot() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.insert("default/a".to_owned(), "a@1");
        store.insert("default/b".to_owned(), "b@1");
        store.insert("default/a".to_owned(), "a@2");

        assert_eq!(store.len(), 2);
        let mut snapshot = store.snapshot();
        snapshot.sort();
        assert_eq!(
            snapshot,
            vec![
                ("default/a".to_owned(), "a@2"),
                ("default/b".to_owned(), "b@1")
            ]
        );
    }

    #[test]
    fn apply_folds_events_into_the_view() {
        let store = MemoryStore::new();

        store.apply(&Event::new(
            TEST_SOURCE,
            EventKind::Addition,
            "default/a".to_owned(),
            "a@1",
        ));
        store.apply(&Event::new(
            TEST_SOURCE,
            EventKind::Modification,
            "default/a".to_owned(),
            "a@2",
        ));
        assert_eq!(store.get("default/a"), Some("a@2"));

        store.apply(&Event::new(
            TEST_SOURCE,
            EventKind::Deletion,
            "default/a".to_owned(),
            "a@2",
        ));
        assert_eq!(store.get("default/a"), None);
    }
}
