//! Bound-property change notifications.
//!
//! The cache exposes a handful of observable properties tracking the
//! initial-load drain. Observers register either globally or for a single
//! property; notifications are dispatched after the cache lock is released,
//! so observers are free to call back into the cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// The observable cache properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Whether the cache has seen its first add or replace.
    Populated,
    /// The number of initially seeded queues not yet taken.
    InitialPopulationCount,
    /// Whether the initial seed has been fully drained.
    Synchronized,
    /// Whether the cache holds no pending queues.
    Empty,
}

/// A single property transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The cache saw its first add or replace.
    Populated,
    /// The initial-population count changed.
    InitialPopulationCount {
        /// The previous count.
        from: usize,
        /// The new count.
        to: usize,
    },
    /// The initial seed has been fully drained.
    Synchronized,
    /// A take left the cache with no pending queues.
    Empty,
}

impl Change {
    /// The property this change belongs to.
    pub fn property(&self) -> Property {
        match self {
            Change::Populated => Property::Populated,
            Change::InitialPopulationCount { .. } => Property::InitialPopulationCount,
            Change::Synchronized => Property::Synchronized,
            Change::Empty => Property::Empty,
        }
    }
}

/// Callback invoked on property changes.
pub type Observer = Box<dyn Fn(&Change) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    global: Vec<Observer>,
    scoped: HashMap<Property, Vec<Observer>>,
}

/// Registry of property observers, keyed by property.
pub(crate) struct Registry {
    subscriptions: Mutex<Subscriptions>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    pub(crate) fn subscribe(&self, observer: Observer) {
        let mut subscriptions = self.lock();
        subscriptions.global.push(observer);
    }

    pub(crate) fn subscribe_to(&self, property: Property, observer: Observer) {
        let mut subscriptions = self.lock();
        subscriptions.scoped.entry(property).or_default().push(observer);
    }

    pub(crate) fn emit(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        let subscriptions = self.lock();
        for change in changes {
            for observer in &subscriptions.global {
                observer(change);
            }
            if let Some(scoped) = subscriptions.scoped.get(&change.property()) {
                for observer in scoped {
                    observer(change);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .expect("observer registry lock poisoned")
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}
