//! xDS resource abstractions.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub mod name;

pub use name::{OLD_STYLE_AUTHORITY, ResourceKey, ResourceName};

/// Outcome of decoding one resource payload.
///
/// `name` is reported whenever the payload got far enough to identify the
/// resource, even if validation failed afterwards; the failure can then be
/// routed to the watchers of that specific resource. Without a name, the
/// error can only travel in the NACK sent back to the server.
#[derive(Debug)]
pub struct DecodeOutcome<T> {
    /// The resource name, if it could be determined.
    pub name: Option<String>,
    /// The decoded resource, or the decode/validation error.
    pub result: Result<T>,
}

impl<T> DecodeOutcome<T> {
    /// A successfully decoded and validated resource.
    pub fn valid(name: impl Into<String>, resource: T) -> Self {
        Self {
            name: Some(name.into()),
            result: Ok(resource),
        }
    }

    /// A payload whose name was recovered but which failed validation.
    pub fn invalid(name: impl Into<String>, error: Error) -> Self {
        Self {
            name: Some(name.into()),
            result: Err(error),
        }
    }

    /// A payload that could not be decoded far enough to name it.
    pub fn unparsable(error: Error) -> Self {
        Self {
            name: None,
            result: Err(error),
        }
    }
}

/// A typed xDS resource.
///
/// # State-of-the-world deletion
///
/// [`ALL_RESOURCES_REQUIRED_IN_SOTW`](Self::ALL_RESOURCES_REQUIRED_IN_SOTW)
/// controls what the absence of a subscribed name from a response means:
///
/// - `true` (the default; listeners, clusters): the server sends the full
///   set every time, so a missing resource has been deleted and its
///   watchers hear about it.
/// - `false` (route configurations, endpoint assignments): responses may be
///   partial; the cached value stays in use.
///
/// # Example
///
/// ```ignore
/// impl Resource for Listener {
///     const TYPE_URL: &'static str = "envoy.config.listener.v3.Listener";
///
///     fn decode(bytes: Bytes) -> DecodeOutcome<Self> {
///         let proto = match ListenerProto::decode(bytes) {
///             Ok(proto) => proto,
///             Err(e) => return DecodeOutcome::unparsable(e.into()),
///         };
///         match validate(&proto) {
///             Ok(listener) => DecodeOutcome::valid(proto.name, listener),
///             Err(e) => DecodeOutcome::invalid(proto.name, e),
///         }
///     }
///
///     fn resources_equal(a: &Self, b: &Self) -> bool {
///         a == b
///     }
/// }
/// ```
pub trait Resource: Sized + Send + Sync + 'static {
    /// Bare type URL, without the `type.googleapis.com/` prefix,
    /// e.g. `envoy.config.listener.v3.Listener`.
    const TYPE_URL: &'static str;

    /// Whether every subscribed resource must appear in each SotW response.
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

    /// Decode and validate a serialized resource.
    ///
    /// Report the name whenever it can be extracted, even when validation
    /// fails afterwards; see [`DecodeOutcome`].
    fn decode(bytes: Bytes) -> DecodeOutcome<Self>;

    /// Whether two resources are equivalent.
    ///
    /// Redelivery of an equivalent resource produces no watcher
    /// notification.
    fn resources_equal(a: &Self, b: &Self) -> bool;
}

/// A decoded resource with its concrete type erased.
///
/// Every resource type has its own validated representation, so the cache
/// stores values behind `dyn Any` and watchers downcast back to the
/// concrete type on delivery. Cloning is cheap; all clones share one
/// underlying value.
#[derive(Clone)]
pub struct DecodedResource {
    type_url: &'static str,
    name: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl DecodedResource {
    /// Erase a concrete resource.
    pub fn new<T: Resource>(name: String, resource: T) -> Self {
        Self {
            type_url: T::TYPE_URL,
            name,
            value: Arc::new(resource),
        }
    }

    /// The bare type URL of the resource.
    pub fn type_url(&self) -> &'static str {
        self.type_url
    }

    /// The name of the resource.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recover the concrete resource, sharing ownership with any other
    /// clones. Returns `None` on a type mismatch.
    pub fn downcast<T: Resource>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast().ok()
    }

    /// Borrow the concrete resource. Returns `None` on a type mismatch.
    pub fn downcast_ref<T: Resource>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl fmt::Debug for DecodedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedResource")
            .field("type_url", &self.type_url)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Object-safe resource type contract used by the client core.
///
/// Most callers implement the typed [`Resource`] trait and let the client
/// erase it. The first implementation registered for a given type URL
/// becomes authoritative; registering a different implementation for the
/// same URL later is a programming error and panics.
pub trait ResourceType: Any + Send + Sync {
    /// The bare type URL this implementation handles.
    fn type_url(&self) -> &'static str;

    /// Whether absence of a subscribed name from a SotW response of this
    /// type means the resource was deleted.
    fn all_resources_required_in_sotw(&self) -> bool;

    /// Decode and validate serialized resource bytes.
    fn decode(&self, bytes: Bytes) -> DecodeOutcome<DecodedResource>;

    /// Whether two decoded resources of this type are equivalent.
    fn resources_equal(&self, a: &DecodedResource, b: &DecodedResource) -> bool;
}

/// Adapter erasing a typed [`Resource`] into the [`ResourceType`] contract.
pub(crate) struct TypedResourceType<T: Resource> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> TypedResourceType<T> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> ResourceType for TypedResourceType<T> {
    fn type_url(&self) -> &'static str {
        T::TYPE_URL
    }

    fn all_resources_required_in_sotw(&self) -> bool {
        T::ALL_RESOURCES_REQUIRED_IN_SOTW
    }

    fn decode(&self, bytes: Bytes) -> DecodeOutcome<DecodedResource> {
        let outcome = T::decode(bytes);
        let result = match outcome.result {
            Ok(resource) => Ok(DecodedResource::new::<T>(
                outcome.name.clone().unwrap_or_default(),
                resource,
            )),
            Err(e) => Err(e),
        };
        DecodeOutcome {
            name: outcome.name,
            result,
        }
    }

    fn resources_equal(&self, a: &DecodedResource, b: &DecodedResource) -> bool {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => T::resources_equal(a, b),
            _ => false,
        }
    }
}
