//! Resource identity extraction.

/// A resource observable through list and watch operations.
///
/// Keys are opaque identities, typically of the `namespace/name` form. A
/// resource that yields no key cannot be cached. Resource versions are only
/// consulted by the reflector to keep its watch position; the cache itself
/// never looks at them.
pub trait Resource {
    /// The cache key identifying this resource, if it has one.
    fn key(&self) -> Option<String>;

    /// The version the origin recorded for this state of the resource, if
    /// any.
    fn resource_version(&self) -> Option<String>;
}
