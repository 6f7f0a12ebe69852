//! List and watch operations against an authoritative resource store.

use futures::{future::BoxFuture, stream::Stream};

#[cfg(any(test, feature = "mock-watcher"))]
pub mod mock;
#[cfg(any(test, feature = "mock-watcher"))]
pub use mock::Mock;

/// A snapshot of resources returned by a list operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceList<T> {
    /// The resources in the snapshot.
    pub items: Vec<T>,
    /// The resource version the snapshot was taken at.
    pub resource_version: String,
}

/// A single action observed on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    /// A resource came into being.
    Added(T),
    /// A resource changed state.
    Modified(T),
    /// A resource went away.
    Deleted(T),
    /// The origin reported a watch-level error; the watch must be rebuilt.
    Error(String),
}

/// List and watch over the changes for a keyed resource.
///
/// Both operations take the resource version to start from as a parameter,
/// so one value of this trait covers the whole reflector lifecycle: the
/// initial list, the watch that follows it, and every rebuild after a
/// disconnect.
pub trait ListWatcher {
    /// The type of the observed resources.
    type Item;

    /// The error type invocation failures use.
    type InvocationError: std::error::Error + Send + 'static;

    /// The error type watch stream failures use.
    type StreamError: std::error::Error + Send + 'static;

    /// The stream type produced by a watch request.
    type Stream: Stream<Item = Result<WatchEvent<Self::Item>, Self::StreamError>> + Send;

    /// Take a snapshot of the current state, starting from
    /// `resource_version`.
    fn list<'a>(
        &'a mut self,
        resource_version: &'a str,
    ) -> BoxFuture<'a, Result<ResourceList<Self::Item>, Self::InvocationError>>;

    /// Issue a single watch request for changes past `resource_version` and
    /// return a stream of results.
    fn watch<'a>(
        &'a mut self,
        resource_version: &'a str,
    ) -> BoxFuture<'a, Result<Self::Stream, Self::InvocationError>>;
}
