//! Controller-side cache of resource change events.
//!
//! Continuously reflects the state of a remote authoritative resource store
//! into a local, consumer-paced event stream. A [`Reflector`] performs an
//! initial list against the store, seeds an [`EventQueueCache`] via replace,
//! and keeps it fed from a long-lived watch; the cache buffers typed events
//! per resource key, compresses redundant ones, and hands one key's queue at
//! a time to a single consumer. Delivery is at-least-once and ordered per
//! key, with periodic resynchronization against an externally maintained
//! view of last-observed state.

#![recursion_limit = "256"] // for async-stream
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    missing_docs
)]

#[macro_use]
extern crate tracing;

pub mod cache;
pub mod event;
pub mod observe;
pub mod queue;
pub mod reflector;
pub mod resource;
pub mod sink;
pub mod state;
pub mod watcher;

mod test_util;

// Reexports for more elegant public API.
pub use cache::EventQueueCache;
pub use event::{Event, EventKind, Source};
pub use queue::EventQueue;
pub use reflector::Reflector;
pub use sink::{EventSink, SinkOutcome};
pub use state::{KnownObjects, MemoryStore};
