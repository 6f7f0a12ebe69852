//! Consumer-side sinks that drain taken event queues.

use async_trait::async_trait;

use crate::queue::EventQueue;

/// Outcome of draining a queue, reported by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// The queue was fully processed.
    Done,
    /// A transient failure occurred; any events left in the queue should be
    /// requeued unless a newer queue for the same key exists.
    RequeueTransient,
}

/// Processes event queues handed over by the cache, one queue at a time.
///
/// The worker retains ownership of the queue: the sink drains it in place by
/// popping events as it processes them, and must not return
/// [`SinkOutcome::Done`] with events left over. On
/// [`SinkOutcome::RequeueTransient`] the unprocessed remainder is reinserted
/// into the cache, unless a newer queue for the key has shown up in the
/// meantime, in which case the remainder is dropped in its favor. Errors are
/// not retried: the worker logs them, discards the queue, and moves on.
#[async_trait]
pub trait EventSink<T>: Send {
    /// The error type for failures the sink cannot recover from.
    type Error: std::error::Error + Send;

    /// Drain `queue`, processing every event before returning.
    async fn drain(&mut self, queue: &mut EventQueue<T>) -> Result<SinkOutcome, Self::Error>;
}
