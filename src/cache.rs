//! The per-key event queue cache.
//!
//! [`EventQueueCache`] buffers typed events per resource key, enforces
//! per-key ordering, compresses redundant events, reconciles itself against
//! an authoritative snapshot via [`replace`], and hands one key's queue at a
//! time to a single consumer through the blocking [`take`] or the managed
//! worker attached with [`start`].
//!
//! [`replace`]: EventQueueCache::replace
//! [`take`]: EventQueueCache::take
//! [`start`]: EventQueueCache::start

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indexmap::map::Entry;
use indexmap::IndexMap;
use metrics::counter;
use snafu::{ensure, OptionExt, Snafu};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

use crate::event::{Event, EventKind, Source};
use crate::observe::{Change, Observer, Property, Registry};
use crate::queue::EventQueue;
use crate::resource::Resource;
use crate::sink::{EventSink, SinkOutcome};
use crate::state::KnownObjects;

/// How long [`EventQueueCache::close`] waits for the consumer worker to
/// finish its current queue before aborting it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

const REPLACE_SOURCE: Source = Source::new("replace");
const SYNCHRONIZE_SOURCE: Source = Source::new("synchronize");

/// Errors the cache reports synchronously to its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum Error {
    /// The resource yields no key, so it cannot be cached.
    #[snafu(display("the resource does not yield a key"))]
    InvalidKey,

    /// The cache is closing; events are rejected until it is restarted.
    #[snafu(display("the cache is closing"))]
    Closed,
}

/// A cache of per-key event queues, cheap to clone and share.
///
/// Queues are delivered in order of first insertion; a key whose queue has
/// been fully consumed and is later re-added moves to the tail. The cache
/// tracks the drain of its initial seed through the `populated`,
/// `initial_population_count` and `synchronized` properties, observable via
/// [`subscribe`] and [`subscribe_to`].
///
/// [`subscribe`]: EventQueueCache::subscribe
/// [`subscribe_to`]: EventQueueCache::subscribe_to
pub struct EventQueueCache<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    shared: Mutex<Shared<T>>,
    wakeup: Notify,
    observers: Registry,
    known: Option<Arc<dyn KnownObjects<T>>>,
}

struct Shared<T> {
    queues: IndexMap<String, EventQueue<T>>,
    populated: bool,
    initial_population_count: usize,
    closing: bool,
    worker: Option<JoinHandle<()>>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            queues: IndexMap::new(),
            populated: false,
            initial_population_count: 0,
            closing: false,
            worker: None,
        }
    }
}

impl<T> Shared<T>
where
    T: Clone,
{
    /// Append `event` to its key's queue, applying dedup, and keep the map
    /// consistent: a queue that compression emptied is deregistered, a new
    /// queue that retained its event is registered at the tail.
    ///
    /// Returns the event iff it was retained.
    fn insert_event(&mut self, event: Event<T>) -> Option<Event<T>> {
        let accepted = event.clone();
        match self.queues.entry(event.key().to_owned()) {
            Entry::Occupied(mut entry) => {
                if entry.get_mut().push(event) {
                    Some(accepted)
                } else {
                    entry.shift_remove();
                    None
                }
            }
            Entry::Vacant(entry) => {
                let mut queue = EventQueue::new(entry.key().clone());
                if queue.push(event) {
                    entry.insert(queue);
                    Some(accepted)
                } else {
                    None
                }
            }
        }
    }
}

impl<T> EventQueueCache<T> {
    /// Create a new cache with no known-objects view.
    ///
    /// Without a view, replace falls back to the newest queued state when
    /// synthesizing deletions, and [`synchronize`] is a no-op.
    ///
    /// [`synchronize`]: EventQueueCache::synchronize
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a new cache reading last-observed state from `known`.
    ///
    /// The view is only ever read, under its own lock; the lock order is
    /// always cache first, view second.
    pub fn with_known_objects(known: Arc<dyn KnownObjects<T>>) -> Self {
        Self::build(Some(known))
    }

    fn build(known: Option<Arc<dyn KnownObjects<T>>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared::new()),
                wakeup: Notify::new(),
                observers: Registry::new(),
                known,
            }),
        }
    }

    /// Register `observer` for every property change.
    pub fn subscribe(&self, observer: Observer) {
        self.inner.observers.subscribe(observer);
    }

    /// Register `observer` for changes of a single property.
    pub fn subscribe_to(&self, property: Property, observer: Observer) {
        self.inner.observers.subscribe_to(property, observer);
    }

    /// Whether the cache has seen its first add or replace.
    pub fn is_populated(&self) -> bool {
        self.shared().populated
    }

    /// Whether the cache has been populated and its initial seed fully
    /// drained.
    pub fn is_synchronized(&self) -> bool {
        let shared = self.shared();
        shared.populated && shared.initial_population_count == 0
    }

    /// The number of pending queues.
    pub fn len(&self) -> usize {
        self.shared().queues.len()
    }

    /// Whether no queues are pending.
    pub fn is_empty(&self) -> bool {
        self.shared().queues.is_empty()
    }

    /// Remove and return the first pending queue in insertion order,
    /// parking until one is available or the cache is closing.
    ///
    /// Returns `None` only when the cache is closing and holds no pending
    /// queues. Each take of an initially seeded queue decrements the
    /// initial-population count, firing the `synchronized` transition when
    /// it reaches zero.
    pub async fn take(&self) -> Option<EventQueue<T>> {
        loop {
            let notified = self.inner.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut shared = self.shared();
                if let Some((_key, queue)) = shared.queues.shift_remove_index(0) {
                    let mut changes = Vec::new();
                    if shared.initial_population_count > 0 {
                        let from = shared.initial_population_count;
                        shared.initial_population_count = from - 1;
                        changes.push(Change::InitialPopulationCount { from, to: from - 1 });
                        if from == 1 {
                            changes.push(Change::Synchronized);
                        }
                    }
                    if shared.queues.is_empty() {
                        changes.push(Change::Empty);
                    }
                    drop(shared);
                    counter!("controller_cache_queues_taken_total").increment(1);
                    self.inner.observers.emit(&changes);
                    return Some(queue);
                }
                if shared.closing {
                    return None;
                }
            }

            notified.as_mut().await;
        }
    }

    /// Close the cache with the default grace period.
    ///
    /// See [`close_with_grace`](EventQueueCache::close_with_grace).
    pub async fn close(&self) {
        self.close_with_grace(DEFAULT_SHUTDOWN_GRACE).await;
    }

    /// Latch the cache into the closing state, unblock all takers, and stop
    /// the consumer worker, waiting up to `grace` for it to finish its
    /// current queue before aborting it.
    ///
    /// Pending queues are retained; a subsequent [`start`] clears the latch
    /// and resumes consumption.
    ///
    /// [`start`]: EventQueueCache::start
    pub async fn close_with_grace(&self, grace: Duration) {
        let worker = {
            let mut shared = self.shared();
            shared.closing = true;
            shared.worker.take()
        };
        self.inner.wakeup.notify_waiters();

        let Some(mut worker) = worker else { return };
        match time::timeout(grace, &mut worker).await {
            Ok(Ok(())) => debug!(message = "Consumer worker stopped cleanly."),
            Ok(Err(error)) => error!(message = "Consumer worker failed.", %error),
            Err(_elapsed) => {
                warn!(
                    message = "Consumer worker did not stop within the grace period, aborting.",
                    grace_secs = grace.as_secs()
                );
                worker.abort();
            }
        }
    }

    /// Reinsert a partially consumed queue after a transient sink failure,
    /// unless a newer queue for the key showed up in the meantime.
    fn requeue(&self, queue: EventQueue<T>) {
        if queue.is_empty() {
            return;
        }
        let key = queue.key().to_owned();
        let reinserted = {
            let mut shared = self.shared();
            match shared.queues.entry(key.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(queue);
                    true
                }
            }
        };
        if reinserted {
            self.inner.wakeup.notify_waiters();
        } else {
            debug!(
                message = "Dropped a requeued queue in favor of a newer one.",
                key = %key
            );
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared<T>> {
        self.inner.shared.lock().expect("cache lock poisoned")
    }
}

impl<T> EventQueueCache<T>
where
    T: Resource + Clone + Send + 'static,
{
    /// Record a change to `resource`, attributed to `source`.
    ///
    /// The event is appended to its key's queue, creating it at the tail of
    /// the take order if absent, and the deduplication rules are applied.
    /// Returns the event iff it was retained, or `None` when compression
    /// absorbed it.
    ///
    /// Fails with [`Error::InvalidKey`] when `resource` yields no key and
    /// with [`Error::Closed`] while the cache is closing.
    pub fn add(&self, source: Source, kind: EventKind, resource: T) -> Result<Option<Event<T>>, Error> {
        let key = resource.key().context(InvalidKeySnafu)?;
        let event = Event::new(source, kind, key, resource);

        let (accepted, changes) = {
            let mut shared = self.shared();
            ensure!(!shared.closing, ClosedSnafu);

            let mut changes = Vec::new();
            if !shared.populated {
                shared.populated = true;
                changes.push(Change::Populated);
            }
            (shared.insert_event(event), changes)
        };

        if accepted.is_some() {
            counter!("controller_cache_events_enqueued_total").increment(1);
            self.inner.wakeup.notify_waiters();
        }
        self.inner.observers.emit(&changes);
        Ok(accepted)
    }

    /// Atomically reconcile the cache against an authoritative snapshot.
    ///
    /// Every incoming resource is enqueued as a synchronization addition.
    /// Keys that are known (to the known-objects view when one is
    /// configured, otherwise to the cache's own pending queues) but absent
    /// from the snapshot get a synthesized deletion carrying the
    /// last-observed state. When this replace is what first populates the
    /// cache, the initial-population count is established as the snapshot
    /// size plus the synthesized deletions.
    ///
    /// `resource_version` is recorded for diagnostics only.
    pub fn replace(
        &self,
        incoming: Vec<T>,
        resource_version: impl Into<String>,
    ) -> Result<(), Error> {
        let resource_version = resource_version.into();
        // Extract every key up front so an invalid resource leaves no
        // partial state behind.
        let incoming = incoming
            .into_iter()
            .map(|resource| {
                resource
                    .key()
                    .context(InvalidKeySnafu)
                    .map(|key| (key, resource))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let changes = {
            let mut shared = self.shared();
            ensure!(!shared.closing, ClosedSnafu);

            let incoming_len = incoming.len();
            let mut replacement_keys = HashSet::with_capacity(incoming_len);
            for (key, resource) in incoming {
                replacement_keys.insert(key.clone());
                shared.insert_event(Event::synchronization(
                    REPLACE_SOURCE,
                    EventKind::Addition,
                    key,
                    resource,
                ));
            }

            let stale: Vec<(String, T)> = match &self.inner.known {
                // Without an external view, the newest queued state is the
                // best approximation of what the deleted resource looked
                // like. This can enqueue a deletion right after a queued
                // one; dedup absorbs the pair.
                None => shared
                    .queues
                    .iter()
                    .filter(|(key, _)| !replacement_keys.contains(*key))
                    .filter_map(|(key, queue)| {
                        queue
                            .last()
                            .map(|event| (key.clone(), event.resource().clone()))
                    })
                    .collect(),
                Some(known) => known
                    .snapshot()
                    .into_iter()
                    .filter(|(key, _)| !replacement_keys.contains(key))
                    .collect(),
            };
            let queued_deletions = stale.len();
            for (key, resource) in stale {
                shared.insert_event(Event::new(
                    REPLACE_SOURCE,
                    EventKind::Deletion,
                    key,
                    resource,
                ));
            }

            let mut changes = Vec::new();
            if !shared.populated {
                shared.populated = true;
                changes.push(Change::Populated);

                let count = incoming_len + queued_deletions;
                shared.initial_population_count = count;
                if count == 0 {
                    changes.push(Change::Synchronized);
                } else {
                    changes.push(Change::InitialPopulationCount { from: 0, to: count });
                }
            }

            debug!(
                message = "Replaced cache contents.",
                %resource_version,
                items = incoming_len,
                deletions = queued_deletions
            );
            changes
        };

        self.inner.wakeup.notify_waiters();
        self.inner.observers.emit(&changes);
        Ok(())
    }

    /// Resynchronize from the known-objects view.
    ///
    /// For every known resource whose key has no pending queue, enqueue a
    /// synchronization modification carrying the last-observed state. Keys
    /// with pending events are left alone: the consumer already has newer
    /// state queued, and layering a resync on top would be redundant.
    ///
    /// A no-op when no view is configured.
    pub fn synchronize(&self) -> Result<(), Error> {
        let Some(known) = &self.inner.known else {
            return Ok(());
        };

        let resynced = {
            let mut shared = self.shared();
            ensure!(!shared.closing, ClosedSnafu);

            let mut resynced = 0usize;
            for (key, resource) in known.snapshot() {
                let pending = shared
                    .queues
                    .get(&key)
                    .is_some_and(|queue| !queue.is_empty());
                if pending {
                    continue;
                }
                shared.insert_event(Event::synchronization(
                    SYNCHRONIZE_SOURCE,
                    EventKind::Modification,
                    key,
                    resource,
                ));
                resynced += 1;
            }
            resynced
        };

        if resynced > 0 {
            trace!(message = "Resynchronized from known objects.", resynced);
            self.inner.wakeup.notify_waiters();
        }
        Ok(())
    }

    /// Attach `sink` and start the single worker draining the cache.
    ///
    /// The worker repeatedly takes a queue and hands it to the sink; see
    /// [`EventSink`] for the requeue and error policy. Idempotent while a
    /// worker is running. Restarting after [`close`] clears the closing
    /// latch and resumes consumption of any retained queues.
    ///
    /// [`close`]: EventQueueCache::close
    pub fn start<S>(&self, sink: S)
    where
        S: EventSink<T> + 'static,
    {
        let mut shared = self.shared();
        if let Some(worker) = &shared.worker {
            if !worker.is_finished() {
                debug!(message = "Consumer worker already running.");
                return;
            }
        }
        shared.closing = false;
        let cache = self.clone();
        shared.worker = Some(tokio::spawn(cache.consume(sink)));
    }

    async fn consume<S>(self, mut sink: S)
    where
        S: EventSink<T>,
    {
        debug!(message = "Consumer worker started.");
        while let Some(mut queue) = self.take().await {
            let key = queue.key().to_owned();
            match sink.drain(&mut queue).await {
                Ok(SinkOutcome::Done) => {}
                Ok(SinkOutcome::RequeueTransient) => self.requeue(queue),
                Err(error) => {
                    error!(
                        message = "Event sink failed; discarding the queue.",
                        %error,
                        key = %key
                    );
                }
            }
        }
        debug!(message = "Consumer worker stopped.");
    }
}

impl<T> Clone for EventQueueCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for EventQueueCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared();
        f.debug_struct("EventQueueCache")
            .field("queues", &shared.queues.len())
            .field("populated", &shared.populated)
            .field("initial_population_count", &shared.initial_population_count)
            .field("closing", &shared.closing)
            .finish_non_exhaustive()
    }
}
