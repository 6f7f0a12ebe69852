//! Typed resource change events.

use std::fmt;

/// Origin attribution for an [`Event`].
///
/// Carried opaquely on every event and never interpreted by the cache; it
/// only shows up in diagnostics and is available to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source(&'static str);

impl Source {
    /// Create a new source marker with the given name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The name of this source.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The kind of change an [`Event`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A resource came into being.
    Addition,
    /// A resource changed state.
    Modification,
    /// A resource went away.
    Deletion,
}

/// A single observed or synthesized change to a keyed resource.
///
/// Events are either real change notifications (see [`Event::new`]) or
/// synchronization events synthesized by cache-wide replace and resync (see
/// [`Event::synchronization`]). A synchronization event's kind is always
/// [`EventKind::Addition`] or [`EventKind::Modification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<T> {
    kind: EventKind,
    synchronization: bool,
    key: String,
    resource: T,
    prior: Option<T>,
    source: Source,
}

impl<T> Event<T> {
    /// Create an event observed from a real change notification.
    pub fn new(source: Source, kind: EventKind, key: String, resource: T) -> Self {
        Self {
            kind,
            synchronization: false,
            key,
            resource,
            prior: None,
            source,
        }
    }

    /// Create a synthesized synchronization event.
    pub fn synchronization(source: Source, kind: EventKind, key: String, resource: T) -> Self {
        debug_assert!(
            !matches!(kind, EventKind::Deletion),
            "synchronization events describe additions or modifications"
        );
        Self {
            kind,
            synchronization: true,
            key,
            resource,
            prior: None,
            source,
        }
    }

    /// Attach the prior state of the resource.
    ///
    /// Prior state is not consulted by the cache; it is carried through for
    /// consumers that want it.
    pub fn with_prior(mut self, prior: T) -> Self {
        self.prior = Some(prior);
        self
    }

    /// The kind of change this event describes.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Whether this event was synthesized by replace or resync rather than
    /// observed from the change stream.
    pub fn is_synchronization(&self) -> bool {
        self.synchronization
    }

    /// The key of the resource this event is about.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The resource payload at the time of the event.
    pub fn resource(&self) -> &T {
        &self.resource
    }

    /// Consume the event, yielding the resource payload.
    pub fn into_resource(self) -> T {
        self.resource
    }

    /// The prior state of the resource, when known.
    pub fn prior(&self) -> Option<&T> {
        self.prior.as_ref()
    }

    /// The origin this event is attributed to.
    pub fn source(&self) -> Source {
        self.source
    }
}
