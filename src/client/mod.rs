//! Client interface through which the user can watch and receive updates for
//! xDS resources.

use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::cache::{AuthorityState, ClientResourceStatus, ResourceState};
use crate::client::channel::{ChannelCommand, ChannelState};
use crate::client::config::{ClientConfig, ServerConfig};
use crate::client::watch::{
    EventSender, ReadDelayHandle, ResourceEvent, ResourceWatcher, WatcherId,
};
use crate::codec::XdsCodec;
use crate::error::Error;
use crate::resource::{DecodedResource, Resource, ResourceName, ResourceType, TypedResourceType};
use crate::runtime::Runtime;
use crate::transport::TransportBuilder;

pub mod config;
pub mod lrs;
pub mod retry;
pub mod watch;

pub(crate) mod ads;
pub(crate) mod cache;
pub(crate) mod channel;

/// All client state guarded by the single client mutex.
pub(crate) struct ClientState {
    /// Resource type implementations seen so far, by type URL.
    pub(crate) resource_types: HashMap<String, Arc<dyn ResourceType>>,
    /// One channel per xDS server, shared across authorities.
    pub(crate) channels: HashMap<String, ChannelState>,
    pub(crate) authorities: HashMap<String, AuthorityState>,
    /// Watchers whose resource name could not be parsed, kept so that
    /// cancellation still works.
    pub(crate) invalid_watchers: HashMap<WatcherId, EventSender>,
}

pub(crate) struct ClientInner<TB, C, R> {
    pub(crate) config: ClientConfig,
    pub(crate) transport_builder: TB,
    pub(crate) codec: C,
    pub(crate) runtime: R,
    /// Back-reference for tasks and timers; they upgrade it and drop out
    /// when the client is gone.
    weak_self: Weak<Self>,
    next_watcher_id: AtomicU64,
    next_channel_id: AtomicU64,
    state: Mutex<ClientState>,
}

impl<TB, C, R> ClientInner<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec + Clone,
    R: Runtime,
{
    pub(crate) fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append the node id to a watcher-visible message, so that it appears in
    /// log messages visible to users.
    pub(crate) fn append_node_id(&self, message: String) -> String {
        match &self.config.node.id {
            Some(id) => format!("{message} (node ID:{id})"),
            None => message,
        }
    }

    /// Register a resource type implementation for its type URL.
    ///
    /// The first implementation registered for a URL is authoritative;
    /// registering a different one later is a programming error.
    fn register_resource_type(&self, resource_type: Arc<dyn ResourceType>) -> &'static str {
        let type_url = resource_type.type_url();
        let mut st = self.state();
        match st.resource_types.entry(type_url.to_string()) {
            Entry::Occupied(existing) => {
                let existing_any: &dyn Any = existing.get().as_ref();
                let new_any: &dyn Any = resource_type.as_ref();
                assert_eq!(
                    existing_any.type_id(),
                    new_any.type_id(),
                    "resource type {type_url} registered with two different implementations"
                );
            }
            Entry::Vacant(vacant) => {
                vacant.insert(resource_type);
            }
        }
        type_url
    }

    /// Every `(type, name)` the cache holds for authorities served by the
    /// given channel. Used to replay subscriptions on stream start.
    pub(crate) fn subscriptions_for_channel(&self, server_key: &str) -> Vec<(String, ResourceName)> {
        let st = self.state();
        let mut subscriptions = Vec::new();
        for (authority_name, authority) in &st.authorities {
            // The channel can be anywhere in the list.
            if !authority.channels.iter().any(|k| k == server_key) {
                continue;
            }
            for (type_url, by_key) in &authority.resources {
                for key in by_key.keys() {
                    subscriptions.push((
                        type_url.clone(),
                        ResourceName {
                            authority: authority_name.clone(),
                            key: key.clone(),
                        },
                    ));
                }
            }
        }
        subscriptions
    }

    pub(crate) fn channel_serves_subscriptions(&self, server_key: &str) -> bool {
        let st = self.state();
        st.authorities.values().any(|authority| {
            authority.channels.iter().any(|k| k == server_key)
                && authority.resources.values().any(|by_key| !by_key.is_empty())
        })
    }

    pub(crate) fn accepted_version(&self, server_key: &str, type_url: &str) -> String {
        let st = self.state();
        st.channels
            .get(server_key)
            .and_then(|c| c.type_versions.get(type_url))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn resource_is_cached(&self, type_url: &str, name: &ResourceName) -> bool {
        let st = self.state();
        st.authorities
            .get(&name.authority)
            .and_then(|a| a.resources.get(type_url))
            .and_then(|m| m.get(&name.key))
            .is_some_and(|entry| entry.resource.is_some())
    }

    pub(crate) fn channel_is_current(&self, server_key: &str, channel_id: u64) -> bool {
        let st = self.state();
        st.channels
            .get(server_key)
            .is_some_and(|c| c.id == channel_id)
    }

    pub(crate) fn bump_stream_epoch(&self, server_key: &str, channel_id: u64) -> u64 {
        let mut st = self.state();
        match st.channels.get_mut(server_key) {
            Some(channel) if channel.id == channel_id => {
                channel.stream_epoch += 1;
                channel.stream_epoch
            }
            _ => 0,
        }
    }

    /// Get or create the channel for a server, spawning its task on first
    /// use. Returns the channel key.
    pub(crate) fn ensure_channel(
        &self,
        channels: &mut HashMap<String, ChannelState>,
        server: &ServerConfig,
    ) -> String {
        let key = server.key().to_string();
        if !channels.contains_key(&key) {
            debug!(server = %server.uri, "creating channel");
            let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            channels.insert(
                key.clone(),
                ChannelState {
                    id: channel_id,
                    server: server.clone(),
                    status: None,
                    type_versions: HashMap::new(),
                    cmd_tx,
                    stream_epoch: 0,
                },
            );
            let inner = self.weak_self.clone();
            self.runtime
                .spawn(channel::run_channel(inner, server.clone(), channel_id, cmd_rx));
        }
        key
    }

    /// Arm the does-not-exist timer for a resource on the current stream.
    pub(crate) fn spawn_resource_timer(
        &self,
        server_key: &str,
        channel_id: u64,
        epoch: u64,
        type_url: String,
        name: ResourceName,
    ) {
        let inner = self.weak_self.clone();
        let runtime = self.runtime.clone();
        let timeout = self.config.request_timeout;
        let server_key = server_key.to_string();
        self.runtime.spawn(async move {
            runtime.sleep(timeout).await;
            if let Some(client) = inner.upgrade() {
                client.on_resource_timeout(&server_key, channel_id, epoch, &type_url, &name);
            }
        });
    }

    /// The request timeout fired. The timer's cancellation is best-effort, so
    /// re-check everything under the lock before acting.
    fn on_resource_timeout(
        &self,
        server_key: &str,
        channel_id: u64,
        epoch: u64,
        type_url: &str,
        name: &ResourceName,
    ) {
        let mut guard = self.state();
        let st = &mut *guard;
        let Some(channel) = st.channels.get(server_key) else {
            return;
        };
        if channel.id != channel_id || channel.stream_epoch != epoch {
            return;
        }
        let Some(entry) = st
            .authorities
            .get_mut(&name.authority)
            .and_then(|a| a.resources.get_mut(type_url))
            .and_then(|m| m.get_mut(&name.key))
        else {
            return;
        };
        // A response may have arrived after the timer fired but before this
        // ran; a resource the server answered for (even with a validation
        // failure) is not declared non-existent.
        if entry.resource.is_some() || entry.meta.client_status == ClientResourceStatus::Nacked {
            return;
        }
        info!(
            server = server_key,
            type_url,
            name = %name,
            "timeout obtaining resource from xds server"
        );
        entry.meta.client_status = ClientResourceStatus::DoesNotExist;
        notify_watchers_does_not_exist(&entry.watchers, &ReadDelayHandle::no_wait());
    }

    /// Register an invalid watcher and deliver its deferred error.
    fn fail_watch(
        &self,
        watcher_id: WatcherId,
        tx: EventSender,
        rx: mpsc::UnboundedReceiver<ResourceEvent>,
        message: String,
    ) -> ResourceWatcher {
        self.state().invalid_watchers.insert(watcher_id, tx.clone());
        let error = Error::Validation(self.append_node_id(message));
        warn!("{error}");
        let _ = tx.send(ResourceEvent::AmbientError {
            error,
            read_delay: ReadDelayHandle::no_wait(),
        });
        let inner = self.weak_self.clone();
        ResourceWatcher {
            rx,
            cancel: Some(Box::new(move |_| {
                if let Some(client) = inner.upgrade() {
                    client.state().invalid_watchers.remove(&watcher_id);
                }
            })),
        }
    }

    fn watch_resource(&self, resource_type: Arc<dyn ResourceType>, name: &str) -> ResourceWatcher {
        let watcher_id = WatcherId(self.next_watcher_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let type_url = self.register_resource_type(resource_type);

        let Ok(resource_name) = ResourceName::parse(name, type_url, self.config.federation) else {
            return self.fail_watch(
                watcher_id,
                tx,
                rx,
                format!("Unable to parse resource name {name}"),
            );
        };
        let servers: Vec<ServerConfig> =
            match self.config.servers_for_authority(&resource_name.authority) {
                Some(list) if !list.is_empty() => list.to_vec(),
                Some(_) => {
                    return self.fail_watch(watcher_id, tx, rx, "no xDS servers configured".into());
                }
                None => {
                    return self.fail_watch(
                        watcher_id,
                        tx,
                        rx,
                        format!(
                            "authority \"{}\" not present in bootstrap config",
                            resource_name.authority
                        ),
                    );
                }
            };

        {
            let mut guard = self.state();
            let ClientState {
                authorities,
                channels,
                ..
            } = &mut *guard;
            let authority = authorities
                .entry(resource_name.authority.clone())
                .or_default();
            let by_key = authority
                .resources
                .entry(type_url.to_string())
                .or_default();
            let is_first_watcher_for_resource = !by_key.contains_key(&resource_name.key);
            let entry = by_key
                .entry(resource_name.key.clone())
                .or_insert_with(ResourceState::new);
            entry.watchers.insert(watcher_id, tx.clone());
            if is_first_watcher_for_resource {
                // Extend the channel list if it is empty or its active
                // channel is failing: the new resource is uncached, so
                // fallback must be attempted now. A channel added here may
                // already be failing for another authority, so keep going
                // until one is healthy or the list is exhausted.
                let active_is_healthy = authority
                    .channels
                    .last()
                    .and_then(|k| channels.get(k))
                    .is_some_and(|c| c.status.is_none());
                if !active_is_healthy {
                    for server in servers.iter().skip(authority.channels.len()) {
                        let key = self.ensure_channel(channels, server);
                        authority.channels.push(key.clone());
                        if channels.get(&key).is_some_and(|c| c.status.is_none()) {
                            break;
                        }
                    }
                }
                // Subscribe on every channel in the list so fallback stacks
                // stay coherent.
                for key in &authority.channels {
                    if let Some(channel) = channels.get(key) {
                        let _ = channel.cmd_tx.send(ChannelCommand::Subscribe {
                            type_url: type_url.to_string(),
                            name: resource_name.clone(),
                        });
                    }
                }
            } else {
                // Replay the cached state to just this watcher.
                if let Some(resource) = &entry.resource {
                    debug!(name, "returning cached resource data");
                    let _ = tx.send(ResourceEvent::ResourceChanged {
                        resource: resource.clone(),
                        read_delay: ReadDelayHandle::no_wait(),
                    });
                } else if entry.meta.client_status == ClientResourceStatus::DoesNotExist {
                    debug!(name, "reporting cached does-not-exist");
                    let _ = tx.send(ResourceEvent::DoesNotExist {
                        read_delay: ReadDelayHandle::no_wait(),
                    });
                } else if entry.meta.client_status == ClientResourceStatus::Nacked {
                    debug!(
                        name,
                        details = %entry.meta.failed_details,
                        "reporting cached validation failure"
                    );
                    let message = self
                        .append_node_id(format!("invalid resource: {}", entry.meta.failed_details));
                    let _ = tx.send(ResourceEvent::AmbientError {
                        error: Error::Validation(message),
                        read_delay: ReadDelayHandle::no_wait(),
                    });
                }
            }
            // Replay any latched channel error to this watcher.
            if let Some(error) = authority
                .channels
                .last()
                .and_then(|k| channels.get(k))
                .and_then(|c| c.status.clone())
            {
                debug!(name, "returning cached channel error");
                let _ = tx.send(ResourceEvent::AmbientError {
                    error,
                    read_delay: ReadDelayHandle::no_wait(),
                });
            }
        }

        let inner = self.weak_self.clone();
        ResourceWatcher {
            rx,
            cancel: Some(Box::new(move |delay_unsubscription| {
                if let Some(client) = inner.upgrade() {
                    client.cancel_watch(type_url, &resource_name, watcher_id, delay_unsubscription);
                }
            })),
        }
    }

    fn cancel_watch(
        &self,
        type_url: &str,
        name: &ResourceName,
        watcher_id: WatcherId,
        delay_unsubscription: bool,
    ) {
        let mut guard = self.state();
        let st = &mut *guard;
        st.invalid_watchers.remove(&watcher_id);
        {
            let ClientState {
                authorities,
                channels,
                ..
            } = &mut *st;
            let Some(authority) = authorities.get_mut(&name.authority) else {
                return;
            };
            let Some(by_key) = authority.resources.get_mut(type_url) else {
                return;
            };
            let Some(entry) = by_key.get_mut(&name.key) else {
                return;
            };
            entry.watchers.remove(&watcher_id);
            if !entry.watchers.is_empty() {
                return;
            }
            if entry.meta.ignored_deletion {
                info!(
                    type_url,
                    name = %name,
                    "unsubscribing from a resource for which a deletion was previously ignored"
                );
            }
            by_key.remove(&name.key);
            let type_is_empty = by_key.is_empty();
            for key in &authority.channels {
                if let Some(channel) = channels.get(key) {
                    let _ = channel.cmd_tx.send(ChannelCommand::Unsubscribe {
                        type_url: type_url.to_string(),
                        name: name.clone(),
                        delay_unsubscription,
                    });
                }
            }
            if type_is_empty {
                authority.resources.remove(type_url);
            }
            if authority.resources.is_empty() {
                authority.channels.clear();
                authorities.remove(&name.authority);
            }
        }
        gc_channels(st);
    }

    fn reset_backoff(&self) {
        let st = self.state();
        for channel in st.channels.values() {
            let _ = channel.cmd_tx.send(ChannelCommand::ResetBackoff);
        }
    }
}

/// Shut down channels no longer referenced by any authority.
pub(crate) fn gc_channels(st: &mut ClientState) {
    let referenced: std::collections::HashSet<String> = st
        .authorities
        .values()
        .flat_map(|a| a.channels.iter().cloned())
        .collect();
    st.channels.retain(|key, channel| {
        if referenced.contains(key) {
            return true;
        }
        debug!(server = %channel.server.uri, "destroying unreferenced channel");
        let _ = channel.cmd_tx.send(ChannelCommand::Shutdown);
        false
    });
}

pub(crate) fn notify_watchers_changed(
    watchers: &HashMap<WatcherId, EventSender>,
    resource: &DecodedResource,
    read_delay: &ReadDelayHandle,
) {
    for tx in watchers.values() {
        let _ = tx.send(ResourceEvent::ResourceChanged {
            resource: resource.clone(),
            read_delay: read_delay.clone(),
        });
    }
}

pub(crate) fn notify_watchers_does_not_exist(
    watchers: &HashMap<WatcherId, EventSender>,
    read_delay: &ReadDelayHandle,
) {
    for tx in watchers.values() {
        let _ = tx.send(ResourceEvent::DoesNotExist {
            read_delay: read_delay.clone(),
        });
    }
}

pub(crate) fn notify_watchers_error(
    watchers: &HashMap<WatcherId, EventSender>,
    error: Error,
    read_delay: &ReadDelayHandle,
) {
    for tx in watchers.values() {
        let _ = tx.send(ResourceEvent::AmbientError {
            error: error.clone(),
            read_delay: read_delay.clone(),
        });
    }
}

pub(crate) fn notify_senders_error(senders: &[EventSender], error: &Error) {
    for tx in senders {
        let _ = tx.send(ResourceEvent::AmbientError {
            error: error.clone(),
            read_delay: ReadDelayHandle::no_wait(),
        });
    }
}

/// Builder for [`XdsClient`].
#[derive(Debug)]
pub struct XdsClientBuilder<TB, C, R> {
    config: ClientConfig,
    transport_builder: TB,
    codec: C,
    runtime: R,
}

impl<TB, C, R> XdsClientBuilder<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec + Clone,
    R: Runtime,
{
    /// Create a new builder with the given configuration and collaborators.
    pub fn new(config: ClientConfig, transport_builder: TB, codec: C, runtime: R) -> Self {
        Self {
            config,
            transport_builder,
            codec,
            runtime,
        }
    }

    /// Build the client.
    pub fn build(self) -> XdsClient<TB, C, R> {
        if let Some(id) = &self.config.node.id {
            debug!(node_id = %id, "creating xds client");
        }
        XdsClient {
            inner: Arc::new_cyclic(|weak| ClientInner {
                config: self.config,
                transport_builder: self.transport_builder,
                codec: self.codec,
                runtime: self.runtime,
                weak_self: weak.clone(),
                next_watcher_id: AtomicU64::new(1),
                next_channel_id: AtomicU64::new(1),
                state: Mutex::new(ClientState {
                    resource_types: HashMap::new(),
                    channels: HashMap::new(),
                    authorities: HashMap::new(),
                    invalid_watchers: HashMap::new(),
                }),
            }),
        }
    }
}

/// The xDS client.
///
/// Cloning this handle creates a new reference to the same client. The
/// client's background tasks wind down when the last handle and the last
/// [`ResourceWatcher`] are dropped.
pub struct XdsClient<TB, C, R> {
    pub(crate) inner: Arc<ClientInner<TB, C, R>>,
}

impl<TB, C, R> Clone for XdsClient<TB, C, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<TB, C, R> std::fmt::Debug for XdsClient<TB, C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsClient").finish_non_exhaustive()
    }
}

impl<TB, C, R> XdsClient<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec + Clone,
    R: Runtime,
{
    /// Create a new builder.
    pub fn builder(
        config: ClientConfig,
        transport_builder: TB,
        codec: C,
        runtime: R,
    ) -> XdsClientBuilder<TB, C, R> {
        XdsClientBuilder::new(config, transport_builder, codec, runtime)
    }

    /// Watch a resource by name.
    ///
    /// Returns a [`ResourceWatcher`] that receives events for this resource.
    /// Dropping the watcher unsubscribes.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut watcher = client.watch::<Listener>("my-listener");
    /// while let Some(event) = watcher.next().await {
    ///     match event {
    ///         ResourceEvent::ResourceChanged { resource, .. } => {
    ///             let listener = resource.downcast::<Listener>().unwrap();
    ///             println!("Listener updated: {}", listener.name);
    ///         }
    ///         ResourceEvent::DoesNotExist { .. } => {
    ///             println!("Listener removed");
    ///         }
    ///         ResourceEvent::AmbientError { error, .. } => {
    ///             println!("Error watching listener: {error}");
    ///         }
    ///     }
    /// }
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if a different resource type implementation was previously
    /// registered for the same type URL.
    pub fn watch<T: Resource>(&self, name: impl AsRef<str>) -> ResourceWatcher {
        self.watch_resource(Arc::new(TypedResourceType::<T>::new()), name)
    }

    /// Watch a resource by name using an explicit [`ResourceType`]
    /// implementation.
    ///
    /// Most callers use [`watch`](Self::watch) instead.
    ///
    /// # Panics
    ///
    /// Panics if a different resource type implementation was previously
    /// registered for the same type URL.
    pub fn watch_resource(
        &self,
        resource_type: Arc<dyn ResourceType>,
        name: impl AsRef<str>,
    ) -> ResourceWatcher {
        self.inner.watch_resource(resource_type, name.as_ref())
    }

    /// Reset connection backoff state on every channel.
    pub fn reset_backoff(&self) {
        self.inner.reset_backoff();
    }
}
