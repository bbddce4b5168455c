//! The per-authority resource cache.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use bytes::Bytes;

use crate::client::watch::{EventSender, WatcherId};
use crate::resource::{DecodedResource, ResourceKey};

/// Client-side view of a cached resource's protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientResourceStatus {
    /// Subscribed, but no response has carried the resource yet.
    Requested,
    /// The last response carrying the resource was accepted.
    Acked,
    /// The last response carrying the resource failed validation.
    Nacked,
    /// The server does not have the resource (explicit SotW omission or
    /// request timeout).
    DoesNotExist,
}

/// Metadata tracked for each cached resource.
#[derive(Debug, Clone)]
pub(crate) struct ResourceMetadata {
    pub(crate) client_status: ClientResourceStatus,
    /// Serialized bytes of the last accepted version.
    pub(crate) serialized_proto: Option<Bytes>,
    /// Version of the last accepted update.
    pub(crate) version: String,
    /// When the last accepted update arrived.
    pub(crate) update_time: Option<SystemTime>,
    /// Version of the last rejected update.
    pub(crate) failed_version: String,
    /// Validation error of the last rejected update.
    pub(crate) failed_details: String,
    /// When the last rejected update arrived.
    pub(crate) failed_update_time: Option<SystemTime>,
    /// A SotW deletion was observed but ignored for this resource.
    pub(crate) ignored_deletion: bool,
}

impl ResourceMetadata {
    pub(crate) fn requested() -> Self {
        Self {
            client_status: ClientResourceStatus::Requested,
            serialized_proto: None,
            version: String::new(),
            update_time: None,
            failed_version: String::new(),
            failed_details: String::new(),
            failed_update_time: None,
            ignored_deletion: false,
        }
    }

    pub(crate) fn set_acked(&mut self, serialized: Bytes, version: String, time: SystemTime) {
        *self = Self {
            client_status: ClientResourceStatus::Acked,
            serialized_proto: Some(serialized),
            version,
            update_time: Some(time),
            ..Self::requested()
        };
    }

    /// Record a rejected update. The last accepted value and version are
    /// retained so watchers keep seeing them.
    pub(crate) fn set_nacked(&mut self, version: String, details: String, time: SystemTime) {
        self.client_status = ClientResourceStatus::Nacked;
        self.failed_version = version;
        self.failed_details = details;
        self.failed_update_time = Some(time);
    }
}

/// Cache entry for one `(authority, type, key)`.
#[derive(Debug)]
pub(crate) struct ResourceState {
    /// The latest accepted value, if any.
    pub(crate) resource: Option<DecodedResource>,
    pub(crate) meta: ResourceMetadata,
    pub(crate) watchers: HashMap<WatcherId, EventSender>,
}

impl ResourceState {
    pub(crate) fn new() -> Self {
        Self {
            resource: None,
            meta: ResourceMetadata::requested(),
            watchers: HashMap::new(),
        }
    }
}

/// All state for one authority: the channels serving it (primary first,
/// fallbacks appended) and the subscribed resources.
#[derive(Debug, Default)]
pub(crate) struct AuthorityState {
    /// Server keys, in fallback order. The last entry is the active channel.
    pub(crate) channels: Vec<String>,
    /// type_url -> resource key -> cache entry.
    pub(crate) resources: HashMap<String, BTreeMap<ResourceKey, ResourceState>>,
}

impl AuthorityState {
    /// Whether any subscribed resource has not yet reached a terminal cache
    /// state. Fallback is only attempted while this holds.
    pub(crate) fn has_uncached_resources(&self) -> bool {
        self.resources.values().any(|by_key| {
            by_key
                .values()
                .any(|state| state.meta.client_status == ClientResourceStatus::Requested)
        })
    }
}
