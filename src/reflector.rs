//! The list+watch driver feeding the cache.

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use futures::{pin_mut, StreamExt};
use metrics::counter;
use snafu::{ResultExt, Snafu};
use tokio::time::{self, MissedTickBehavior};

use crate::cache::{self, EventQueueCache};
use crate::event::{EventKind, Source};
use crate::resource::Resource;
use crate::watcher::{ListWatcher, WatchEvent};

/// The resource version the initial list starts from.
const STARTING_RESOURCE_VERSION: &str = "0";

/// How long the reflector waits before rebuilding an interrupted watch.
const DEFAULT_PAUSE_BETWEEN_REQUESTS: Duration = Duration::from_secs(1);

const WATCH_SOURCE: Source = Source::new("reflector");

/// Decides whether a resynchronization failure is survivable: `true` to log
/// and keep the periodic resync running, `false` to disable it.
pub type ResyncErrorPolicy = Box<dyn Fn(&cache::Error) -> bool + Send>;

/// Errors that can occur while reflecting.
#[derive(Debug, Snafu)]
pub enum Error<I>
where
    I: std::error::Error + 'static,
{
    /// Returned when the list request fails; the caller may retry by
    /// running the reflector again.
    #[snafu(display("failed to list the resource snapshot"))]
    List {
        /// The underlying error.
        source: I,
    },

    /// Returned when the watch request itself fails.
    #[snafu(display("failed to start the watch"))]
    WatchStart {
        /// The underlying error.
        source: I,
    },

    /// Returned when the cache rejects an event or a reseed, which happens
    /// when it is shut down underneath the reflector.
    #[snafu(display("the cache rejected an event"))]
    Cache {
        /// The underlying error.
        source: cache::Error,
    },
}

enum Step<T> {
    Item(T),
    Resync,
}

/// Drives a list+watch operation into an [`EventQueueCache`].
///
/// [`run`] performs an initial list, seeds the cache via replace, then pumps
/// a long-lived watch into cache additions, rebuilding the watch (list
/// first) whenever the stream fails or ends. When a resync interval is
/// configured, the cache is resynchronized on that schedule (first tick
/// right after the seed), interleaved with the watch on the same task.
///
/// Dropping the [`run`] future is the clean shutdown: it cancels the watch
/// and the resync schedule together.
///
/// [`run`]: Reflector::run
pub struct Reflector<W>
where
    W: ListWatcher,
{
    watcher: W,
    cache: EventQueueCache<W::Item>,
    resync_interval: Option<Duration>,
    resync_error_policy: ResyncErrorPolicy,
    pause_between_requests: Duration,
    last_resource_version: Option<String>,
}

impl<W> Reflector<W>
where
    W: ListWatcher,
    W::Item: Resource + Clone + Send + 'static,
{
    /// Create a new [`Reflector`].
    ///
    /// When `resync_interval` is `None`, no periodic resynchronization is
    /// scheduled.
    pub fn new(
        watcher: W,
        cache: EventQueueCache<W::Item>,
        resync_interval: Option<Duration>,
    ) -> Self {
        Self {
            watcher,
            cache,
            resync_interval,
            resync_error_policy: Box::new(|_| true),
            pause_between_requests: DEFAULT_PAUSE_BETWEEN_REQUESTS,
            last_resource_version: None,
        }
    }

    /// Replace the policy consulted when a periodic resynchronization
    /// fails. The default treats every failure as survivable.
    pub fn set_resync_error_policy(&mut self, policy: ResyncErrorPolicy) {
        self.resync_error_policy = policy;
    }

    /// Adjust the pause before an interrupted watch is rebuilt.
    pub fn set_pause_between_requests(&mut self, pause: Duration) {
        self.pause_between_requests = pause;
    }

    /// The cache this reflector feeds.
    pub fn cache(&self) -> &EventQueueCache<W::Item> {
        &self.cache
    }

    /// The resource version last observed from the origin, for diagnostics.
    pub fn last_resource_version(&self) -> Option<&str> {
        self.last_resource_version.as_deref()
    }

    /// Reflect the remote store into the cache until a failure that cannot
    /// be recovered by rebuilding the watch.
    pub async fn run(&mut self) -> Result<Infallible, Error<W::InvocationError>> {
        let mut resync = self.resync_interval.map(|period| {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            // Watch interruptions of any kind are recovered by reconciling
            // against a fresh snapshot.
            let list = self
                .watcher
                .list(STARTING_RESOURCE_VERSION)
                .await
                .context(ListSnafu)?;
            let resource_version = list.resource_version.clone();
            self.cache
                .replace(list.items, list.resource_version)
                .context(CacheSnafu)?;
            self.last_resource_version = Some(resource_version.clone());
            debug!(
                message = "Seeded the cache from a list snapshot.",
                resource_version = %resource_version
            );

            let stream = self
                .watcher
                .watch(&resource_version)
                .await
                .context(WatchStartSnafu)?;
            counter!("reflector_watch_invocations_total").increment(1);
            pin_mut!(stream);

            loop {
                let step = match resync.as_mut() {
                    Some(interval) => tokio::select! {
                        item = stream.next() => Step::Item(item),
                        _ = interval.tick() => Step::Resync,
                    },
                    None => Step::Item(stream.next().await),
                };

                match step {
                    Step::Resync => {
                        counter!("reflector_resyncs_total").increment(1);
                        if let Err(error) = self.cache.synchronize() {
                            if (self.resync_error_policy)(&error) {
                                warn!(message = "Resynchronization failed, continuing.", %error);
                            } else {
                                error!(
                                    message = "Resynchronization failed, disabling periodic resync.",
                                    %error
                                );
                                resync = None;
                            }
                        }
                    }
                    Step::Item(Some(Ok(event))) => {
                        if !self.observe(event).context(CacheSnafu)? {
                            break;
                        }
                    }
                    Step::Item(Some(Err(error))) => {
                        warn!(message = "Watch stream failed, rebuilding.", %error);
                        break;
                    }
                    Step::Item(None) => {
                        debug!(message = "Watch stream ended, rebuilding.");
                        break;
                    }
                }
            }

            time::sleep(self.pause_between_requests).await;
        }
    }

    /// Apply a single watch action to the cache, keeping the last observed
    /// resource version current. Returns whether the watch may continue.
    fn observe(&mut self, event: WatchEvent<W::Item>) -> Result<bool, cache::Error> {
        let (kind, resource) = match event {
            WatchEvent::Added(resource) => (EventKind::Addition, resource),
            WatchEvent::Modified(resource) => (EventKind::Modification, resource),
            WatchEvent::Deleted(resource) => (EventKind::Deletion, resource),
            WatchEvent::Error(message) => {
                warn!(message = "Watch error action received, rebuilding.", error = %message);
                return Ok(false);
            }
        };

        let resource_version = resource.resource_version();
        self.cache.add(WATCH_SOURCE, kind, resource)?;
        counter!("reflector_watch_events_total").increment(1);
        if let Some(version) = resource_version {
            self.last_resource_version = Some(version);
        }
        Ok(true)
    }
}

impl<W> fmt::Debug for Reflector<W>
where
    W: ListWatcher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reflector")
            .field("resync_interval", &self.resync_interval)
            .field("pause_between_requests", &self.pause_between_requests)
            .field("last_resource_version", &self.last_resource_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::test_util::{trace_init, TestResource};
    use crate::watcher::mock::{
        Mock, ScenarioActionList, ScenarioActionStream, ScenarioActionWatch, ScenarioEvent,
    };
    use crate::watcher::ResourceList;
    use futures::channel::mpsc::{channel, Receiver, Sender};
    use futures::{SinkExt, StreamExt};
    use std::sync::Arc;

    fn resource(name: &str, version: &str) -> TestResource {
        TestResource::new(name, version)
    }

    #[allow(clippy::type_complexity)]
    fn make_mock() -> (
        Mock<TestResource>,
        Receiver<ScenarioEvent>,
        Sender<ScenarioActionList<TestResource>>,
        Sender<ScenarioActionWatch<TestResource>>,
    ) {
        let (events_tx, events_rx) = channel(16);
        let (list_tx, list_rx) = channel(8);
        let (watch_tx, watch_rx) = channel(8);
        (Mock::new(events_tx, list_rx, watch_rx), events_rx, list_tx, watch_tx)
    }

    fn snapshot(items: Vec<TestResource>, resource_version: &str) -> ScenarioActionList<TestResource> {
        ScenarioActionList::Ok(ResourceList {
            items,
            resource_version: resource_version.to_owned(),
        })
    }

    #[tokio::test]
    async fn seeds_from_list_and_pumps_watch_events() {
        trace_init();
        let (mock, mut events_rx, mut list_tx, mut watch_tx) = make_mock();
        let cache = EventQueueCache::new();
        let mut reflector = Reflector::new(mock, cache.clone(), None);

        let run = tokio::spawn(async move { reflector.run().await });

        // The initial list starts from the zero resource version.
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );
        list_tx
            .send(snapshot(vec![resource("default/a", "v1")], "v1"))
            .await
            .unwrap();

        // The watch resumes from the list's resource version.
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::Watch("v1".to_owned())
        );
        let (mut stream_tx, stream_rx) = channel(8);
        watch_tx.send(ScenarioActionWatch::Ok(stream_rx)).await.unwrap();

        assert_eq!(events_rx.next().await.unwrap(), ScenarioEvent::Stream);
        stream_tx
            .send(ScenarioActionStream::Ok(WatchEvent::Added(resource(
                "default/b", "v2",
            ))))
            .await
            .unwrap();

        // The seeded queue drains first, then the watched addition.
        let queue = cache.take().await.unwrap();
        assert_eq!(queue.key(), "default/a");
        assert!(queue.last().unwrap().is_synchronization());
        assert_eq!(queue.last().unwrap().kind(), EventKind::Addition);

        let queue = cache.take().await.unwrap();
        assert_eq!(queue.key(), "default/b");
        let event = queue.last().unwrap();
        assert!(!event.is_synchronization());
        assert_eq!(event.kind(), EventKind::Addition);
        assert!(cache.is_synchronized());

        run.abort();
    }

    #[tokio::test]
    async fn stream_failure_triggers_a_fresh_list() {
        trace_init();
        let (mock, mut events_rx, mut list_tx, mut watch_tx) = make_mock();
        let cache = EventQueueCache::new();
        let mut reflector = Reflector::new(mock, cache.clone(), None);
        reflector.set_pause_between_requests(Duration::ZERO);

        let run = tokio::spawn(async move { reflector.run().await });

        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );
        list_tx.send(snapshot(Vec::new(), "v1")).await.unwrap();
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::Watch("v1".to_owned())
        );
        let (mut stream_tx, stream_rx) = channel(8);
        watch_tx.send(ScenarioActionWatch::Ok(stream_rx)).await.unwrap();

        assert_eq!(events_rx.next().await.unwrap(), ScenarioEvent::Stream);
        stream_tx.send(ScenarioActionStream::Err).await.unwrap();

        // The reflector rebuilds, list first.
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );
        list_tx
            .send(snapshot(vec![resource("default/a", "v2")], "v2"))
            .await
            .unwrap();
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::Watch("v2".to_owned())
        );

        let queue = cache.take().await.unwrap();
        assert_eq!(queue.key(), "default/a");
        assert!(queue.last().unwrap().is_synchronization());

        run.abort();
    }

    #[tokio::test]
    async fn watch_error_action_triggers_a_fresh_list() {
        trace_init();
        let (mock, mut events_rx, mut list_tx, mut watch_tx) = make_mock();
        let cache: EventQueueCache<TestResource> = EventQueueCache::new();
        let mut reflector = Reflector::new(mock, cache.clone(), None);
        reflector.set_pause_between_requests(Duration::ZERO);

        let run = tokio::spawn(async move { reflector.run().await });

        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );
        list_tx.send(snapshot(Vec::new(), "v1")).await.unwrap();
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::Watch("v1".to_owned())
        );
        let (mut stream_tx, stream_rx) = channel(8);
        watch_tx.send(ScenarioActionWatch::Ok(stream_rx)).await.unwrap();

        assert_eq!(events_rx.next().await.unwrap(), ScenarioEvent::Stream);
        stream_tx
            .send(ScenarioActionStream::Ok(WatchEvent::Error(
                "resource version too old".to_owned(),
            )))
            .await
            .unwrap();

        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );

        run.abort();
    }

    #[tokio::test]
    async fn list_failure_propagates_to_the_caller() {
        trace_init();
        let (mock, mut events_rx, mut list_tx, _watch_tx) = make_mock();
        let cache: EventQueueCache<TestResource> = EventQueueCache::new();
        let mut reflector = Reflector::new(mock, cache, None);

        let run = tokio::spawn(async move { reflector.run().await });

        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );
        list_tx.send(ScenarioActionList::Err).await.unwrap();

        let error = run.await.unwrap().unwrap_err();
        assert!(matches!(error, Error::List { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_resync_emits_synchronization_events() {
        trace_init();
        let (mock, mut events_rx, mut list_tx, mut watch_tx) = make_mock();
        let known = Arc::new(MemoryStore::new());
        known.insert("default/c".to_owned(), resource("default/c", "v1"));
        let cache = EventQueueCache::with_known_objects(known);
        let mut reflector = Reflector::new(mock, cache.clone(), Some(Duration::from_secs(30)));
        reflector.set_pause_between_requests(Duration::ZERO);

        let run = tokio::spawn(async move { reflector.run().await });

        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );
        list_tx
            .send(snapshot(vec![resource("default/c", "v1")], "v1"))
            .await
            .unwrap();
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::Watch("v1".to_owned())
        );
        let (_stream_tx, stream_rx) = channel::<ScenarioActionStream<TestResource>>(8);
        watch_tx.send(ScenarioActionWatch::Ok(stream_rx)).await.unwrap();

        // Drain the seeded queue so the key is resyncable again.
        let queue = cache.take().await.unwrap();
        assert_eq!(queue.key(), "default/c");
        assert!(queue.last().unwrap().is_synchronization());
        assert_eq!(queue.last().unwrap().kind(), EventKind::Addition);

        // The next resync tick synthesizes a modification for the known key.
        let queue = cache.take().await.unwrap();
        assert_eq!(queue.key(), "default/c");
        let event = queue.last().unwrap();
        assert!(event.is_synchronization());
        assert_eq!(event.kind(), EventKind::Modification);

        run.abort();
    }

    #[tokio::test]
    async fn cache_closed_during_watch_propagates() {
        trace_init();
        let (mock, mut events_rx, mut list_tx, mut watch_tx) = make_mock();
        let cache: EventQueueCache<TestResource> = EventQueueCache::new();
        let mut reflector = Reflector::new(mock, cache.clone(), None);

        let run = tokio::spawn(async move { reflector.run().await });

        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::List("0".to_owned())
        );
        list_tx.send(snapshot(Vec::new(), "v1")).await.unwrap();
        assert_eq!(
            events_rx.next().await.unwrap(),
            ScenarioEvent::Watch("v1".to_owned())
        );
        let (mut stream_tx, stream_rx) = channel(8);
        watch_tx.send(ScenarioActionWatch::Ok(stream_rx)).await.unwrap();

        cache.close().await;

        assert_eq!(events_rx.next().await.unwrap(), ScenarioEvent::Stream);
        stream_tx
            .send(ScenarioActionStream::Ok(WatchEvent::Added(resource(
                "default/a", "v2",
            ))))
            .await
            .unwrap();

        let error = run.await.unwrap().unwrap_err();
        assert!(matches!(
            error,
            Error::Cache {
                source: cache::Error::Closed
            }
        ));
    }
}
