//! A mock list+watch operation.

use super::{ListWatcher, ResourceList, WatchEvent};
use async_stream::try_stream;
use futures::channel::mpsc::{Receiver, Sender};
use futures::{future::BoxFuture, stream::BoxStream, SinkExt, StreamExt};
use std::fmt;

/// An event that's sent to the test scenario driver.
#[derive(Debug, PartialEq, Eq)]
pub enum ScenarioEvent {
    /// A list invocation was issued, starting from the given resource
    /// version.
    List(String),
    /// A watch invocation was issued, starting from the given resource
    /// version.
    Watch(String),
    /// The next stream item is being produced.
    Stream,
}

/// An action that's sent from the test scenario driver to specify the
/// list invocation result.
#[derive(Debug)]
pub enum ScenarioActionList<T> {
    /// Return a snapshot.
    Ok(ResourceList<T>),
    /// Return an error.
    Err,
}

/// An action that's sent from the test scenario driver to specify the
/// watch invocation result.
#[derive(Debug)]
pub enum ScenarioActionWatch<T> {
    /// Return successfully and prepare the stream with responses from the
    /// passed [`Receiver`].
    Ok(Receiver<ScenarioActionStream<T>>),
    /// Return an error.
    Err,
}

/// An action that's sent from the test scenario driver to specify the
/// stream item request result.
#[derive(Debug)]
pub enum ScenarioActionStream<T> {
    /// Yield a watch event.
    Ok(WatchEvent<T>),
    /// Fail the stream.
    Err,
    /// Complete the stream (return `None`).
    Done,
}

/// A mock list+watch operation, useful for tests.
///
/// Every invocation reports a [`ScenarioEvent`] to the test scenario driver
/// and then waits for the driver to specify the result via the
/// corresponding action channel.
#[derive(Debug)]
pub struct Mock<T> {
    events_tx: Sender<ScenarioEvent>,
    list_rx: Receiver<ScenarioActionList<T>>,
    watch_rx: Receiver<ScenarioActionWatch<T>>,
}

impl<T> Mock<T> {
    /// Create a new [`Mock`].
    pub fn new(
        events_tx: Sender<ScenarioEvent>,
        list_rx: Receiver<ScenarioActionList<T>>,
        watch_rx: Receiver<ScenarioActionWatch<T>>,
    ) -> Self {
        Self {
            events_tx,
            list_rx,
            watch_rx,
        }
    }
}

impl<T> ListWatcher for Mock<T>
where
    T: Send + Unpin + 'static,
{
    type Item = T;

    type InvocationError = InvocationError;

    type StreamError = StreamError;
    type Stream = BoxStream<'static, Result<WatchEvent<T>, StreamError>>;

    fn list<'a>(
        &'a mut self,
        resource_version: &'a str,
    ) -> BoxFuture<'a, Result<ResourceList<T>, Self::InvocationError>> {
        Box::pin(async move {
            self.events_tx
                .send(ScenarioEvent::List(resource_version.to_owned()))
                .await
                .unwrap();

            match self.list_rx.next().await.unwrap() {
                ScenarioActionList::Ok(list) => Ok(list),
                ScenarioActionList::Err => Err(InvocationError),
            }
        })
    }

    fn watch<'a>(
        &'a mut self,
        resource_version: &'a str,
    ) -> BoxFuture<'a, Result<Self::Stream, Self::InvocationError>> {
        let mut stream_events_tx = self.events_tx.clone();
        Box::pin(async move {
            self.events_tx
                .send(ScenarioEvent::Watch(resource_version.to_owned()))
                .await
                .unwrap();

            match self.watch_rx.next().await.unwrap() {
                ScenarioActionWatch::Ok(mut stream_rx) => {
                    let stream = Box::pin(try_stream! {
                        loop {
                            stream_events_tx.send(ScenarioEvent::Stream)
                                .await
                                .unwrap();

                            let action = stream_rx.next().await.unwrap();
                            match action {
                                ScenarioActionStream::Ok(val) => {
                                    yield val
                                },
                                ScenarioActionStream::Err => {
                                    Err(StreamError)?;
                                    break;
                                },
                                ScenarioActionStream::Done => break,
                            }
                        }
                    })
                        as BoxStream<'static, Result<WatchEvent<T>, Self::StreamError>>;
                    Ok(stream)
                }
                ScenarioActionWatch::Err => Err(InvocationError),
            }
        })
    }
}

/// An error kind for the mock invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationError;

/// An error kind for the mock watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamError;

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for InvocationError {}
impl std::error::Error for StreamError {}
