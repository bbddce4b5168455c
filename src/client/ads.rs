//! The ADS call state machine.
//!
//! One [`AdsCall`] exists per live stream. It tracks the per-type nonce and
//! pending NACK, the per-stream subscription set with its resource timers,
//! and the outbound send gating: at most one request is in flight, and types
//! that become dirty while a send is pending are coalesced into a set, with
//! the request body rebuilt from the live subscription set at send time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Weak;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::client::ClientInner;
use crate::client::cache::ClientResourceStatus;
use crate::client::channel::{ChannelCommand, set_healthy_locked};
use crate::client::config::ServerConfig;
use crate::client::watch::ReadDelayHandle;
use crate::client::{notify_watchers_changed, notify_watchers_does_not_exist, notify_watchers_error};
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::{CODE_INVALID_ARGUMENT, DiscoveryRequest, ErrorDetail};
use crate::resource::name::format_name;
use crate::resource::{ResourceKey, ResourceName};
use crate::runtime::Runtime;
use crate::transport::{TransportBuilder, TransportStream};

/// Why an ADS call ended.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    /// The client is shutting the channel down.
    Shutdown,
    /// The last subscribed resource was unsubscribed; the stream is closed
    /// deliberately.
    NoSubscriptions,
    /// The transport stream terminated.
    StreamClosed(Option<Error>),
}

/// Per-stream subscription bookkeeping for one resource.
#[derive(Debug, Default)]
struct SubscriptionState {
    /// The resource name has appeared in a request sent on this stream.
    subscription_sent: bool,
    /// A response on this stream has carried the resource.
    resource_seen: bool,
    /// The does-not-exist timer has been armed on this stream.
    timer_armed: bool,
}

/// Per-type state for the current stream.
#[derive(Debug, Default)]
struct TypeState {
    /// Nonce of the most recent response of this type on this stream.
    nonce: String,
    /// Pending NACK detail, consumed by the next request for this type.
    nack_error: Option<String>,
    /// authority -> resource key -> subscription state.
    subscribed: BTreeMap<String, BTreeMap<ResourceKey, SubscriptionState>>,
}

/// State for one live ADS streaming call.
pub(crate) struct AdsCall {
    server: ServerConfig,
    channel_id: u64,
    epoch: u64,
    type_states: HashMap<String, TypeState>,
    /// Types with a pending request. The request identity is the current
    /// subscription set at send time, not a queue of historical requests.
    buffered_requests: BTreeSet<String>,
    sent_initial_message: bool,
    seen_response: bool,
}

impl AdsCall {
    /// Create the call state for a new stream, replaying every subscription
    /// the cache holds for this channel, and build the initial requests.
    ///
    /// Returns the call, the encoded initial requests, and the resource
    /// names they carry (to arm timers once the stream is established).
    pub(crate) fn start<TB, C, R>(
        client: &ClientInner<TB, C, R>,
        server: &ServerConfig,
        channel_id: u64,
        epoch: u64,
    ) -> (Self, Vec<Bytes>, Vec<(String, ResourceName)>)
    where
        TB: TransportBuilder,
        C: XdsCodec + Clone,
        R: Runtime,
    {
        let mut call = Self {
            server: server.clone(),
            channel_id,
            epoch,
            type_states: HashMap::new(),
            buffered_requests: BTreeSet::new(),
            sent_initial_message: false,
            seen_response: false,
        };
        for (type_url, name) in client.subscriptions_for_channel(server.key()) {
            call.subscribe(&type_url, name);
        }
        let mut initial_requests = Vec::new();
        let mut sent_names = Vec::new();
        let mut type_urls: Vec<String> = call.type_states.keys().cloned().collect();
        type_urls.sort();
        for type_url in type_urls {
            match call.build_request(client, &type_url) {
                Ok((bytes, names)) => {
                    initial_requests.push(bytes);
                    sent_names.extend(names.into_iter().map(|n| (type_url.clone(), n)));
                }
                Err(e) => error!(%type_url, "failed to encode initial ADS request: {e}"),
            }
        }
        (call, initial_requests, sent_names)
    }

    pub(crate) fn seen_response(&self) -> bool {
        self.seen_response
    }

    pub(crate) fn has_subscribed_resources(&self) -> bool {
        self.type_states
            .values()
            .any(|state| !state.subscribed.is_empty())
    }

    /// Add a subscription for this stream. Returns true if it was new.
    fn subscribe(&mut self, type_url: &str, name: ResourceName) -> bool {
        let by_key = self
            .type_states
            .entry(type_url.to_string())
            .or_default()
            .subscribed
            .entry(name.authority)
            .or_default();
        match by_key.entry(name.key) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(SubscriptionState::default());
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Remove a subscription. Returns true if a request should go out.
    fn unsubscribe(&mut self, type_url: &str, name: &ResourceName, delay_unsubscription: bool) -> bool {
        if let Some(state) = self.type_states.get_mut(type_url) {
            if let Some(by_key) = state.subscribed.get_mut(&name.authority) {
                by_key.remove(&name.key);
                if by_key.is_empty() {
                    state.subscribed.remove(&name.authority);
                }
            }
        }
        // No unsubscription request is needed for the last resource: the
        // stream is closed immediately in that case.
        !delay_unsubscription && self.has_subscribed_resources()
    }

    /// Build a DiscoveryRequest for one type from the live subscription set.
    ///
    /// Marks every included name as subscription-sent and consumes any
    /// pending NACK detail for the type.
    fn build_request<TB, C, R>(
        &mut self,
        client: &ClientInner<TB, C, R>,
        type_url: &str,
    ) -> Result<(Bytes, Vec<ResourceName>)>
    where
        TB: TransportBuilder,
        C: XdsCodec + Clone,
        R: Runtime,
    {
        let version = client.accepted_version(self.server.key(), type_url);
        let state = self.type_states.entry(type_url.to_string()).or_default();
        let mut resource_names = Vec::new();
        let mut included = Vec::new();
        for (authority, by_key) in state.subscribed.iter_mut() {
            for (key, subscription) in by_key.iter_mut() {
                resource_names.push(format_name(authority, type_url, key));
                subscription.subscription_sent = true;
                included.push(ResourceName {
                    authority: authority.clone(),
                    key: key.clone(),
                });
            }
        }
        let error_detail = state.nack_error.take().map(|message| ErrorDetail {
            code: CODE_INVALID_ARGUMENT,
            message,
        });
        debug!(
            server = %self.server.uri,
            type_url,
            %version,
            nonce = %state.nonce,
            nack = error_detail.is_some(),
            "sending ADS request"
        );
        let request = DiscoveryRequest {
            version_info: version,
            node: if self.sent_initial_message {
                None
            } else {
                Some(client.config.node.clone())
            },
            resource_names,
            type_url: format!("type.googleapis.com/{type_url}"),
            response_nonce: state.nonce.clone(),
            error_detail,
        };
        self.sent_initial_message = true;
        let bytes = client.codec.encode_request(&request)?;
        Ok((bytes, included))
    }

    /// Bookkeeping after a request has been handed to the transport: arm the
    /// does-not-exist timer for every name it carried, unless the resource
    /// was already seen or a cached value exists (stream restart replay).
    pub(crate) fn on_requests_sent<TB, C, R>(
        &mut self,
        client: &ClientInner<TB, C, R>,
        names: Vec<(String, ResourceName)>,
    ) where
        TB: TransportBuilder,
        C: XdsCodec + Clone,
        R: Runtime,
    {
        for (type_url, name) in names {
            let Some(subscription) = self
                .type_states
                .get_mut(&type_url)
                .and_then(|s| s.subscribed.get_mut(&name.authority))
                .and_then(|m| m.get_mut(&name.key))
            else {
                continue;
            };
            if !subscription.subscription_sent
                || subscription.resource_seen
                || subscription.timer_armed
            {
                continue;
            }
            if client.resource_is_cached(&type_url, &name) {
                continue;
            }
            subscription.timer_armed = true;
            client.spawn_resource_timer(self.server.key(), self.channel_id, self.epoch, type_url, name);
        }
    }

    /// Drive the stream until it ends.
    pub(crate) async fn run<TB, C, R, S>(
        &mut self,
        inner: &Weak<ClientInner<TB, C, R>>,
        stream: &mut S,
        cmd_rx: &mut mpsc::UnboundedReceiver<ChannelCommand>,
    ) -> CallOutcome
    where
        TB: TransportBuilder,
        C: XdsCodec + Clone,
        R: Runtime,
        S: TransportStream,
    {
        let mut read_gate: Option<oneshot::Receiver<()>> = None;
        loop {
            // Flush one pending request before polling for events; at most
            // one request per type is ever in flight.
            if let Some(type_url) = self.buffered_requests.pop_first() {
                let Some(client) = inner.upgrade() else {
                    return CallOutcome::Shutdown;
                };
                match self.build_request(&client, &type_url) {
                    Ok((bytes, names)) => {
                        if let Err(e) = stream.send(bytes).await {
                            return CallOutcome::StreamClosed(Some(e));
                        }
                        let names = names.into_iter().map(|n| (type_url.clone(), n)).collect();
                        self.on_requests_sent(&client, names);
                    }
                    Err(e) => error!(%type_url, "failed to encode ADS request: {e}"),
                }
                continue;
            }
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(ChannelCommand::Shutdown) => return CallOutcome::Shutdown,
                    Some(ChannelCommand::Subscribe { type_url, name }) => {
                        if self.subscribe(&type_url, name) {
                            self.buffered_requests.insert(type_url);
                        }
                    }
                    Some(ChannelCommand::Unsubscribe { type_url, name, delay_unsubscription }) => {
                        if self.unsubscribe(&type_url, &name, delay_unsubscription) {
                            self.buffered_requests.insert(type_url);
                        }
                        if !self.has_subscribed_resources() {
                            return CallOutcome::NoSubscriptions;
                        }
                    }
                    Some(ChannelCommand::ResetBackoff) => {}
                },
                message = gated_recv(stream, &mut read_gate) => match message {
                    Ok(Some(bytes)) => {
                        let Some(client) = inner.upgrade() else {
                            return CallOutcome::Shutdown;
                        };
                        read_gate = self.handle_response(&client, bytes);
                    }
                    Ok(None) => return CallOutcome::StreamClosed(None),
                    Err(e) => return CallOutcome::StreamClosed(Some(e)),
                },
            }
        }
    }

    /// Process one DiscoveryResponse: update the cache, notify watchers, and
    /// schedule the ACK/NACK.
    ///
    /// Returns the read gate that must resolve before the next message is
    /// read from the stream.
    fn handle_response<TB, C, R>(
        &mut self,
        client: &ClientInner<TB, C, R>,
        bytes: Bytes,
    ) -> Option<oneshot::Receiver<()>>
    where
        TB: TransportBuilder,
        C: XdsCodec + Clone,
        R: Runtime,
    {
        let envelope = match client.codec.decode_response(bytes) {
            Ok(response) => response,
            Err(e) => {
                error!(server = %self.server.uri, "error parsing ADS response ({e}) -- ignoring");
                return None;
            }
        };
        let type_url = envelope.type_url.clone();
        debug!(
            server = %self.server.uri,
            %type_url,
            version = %envelope.version_info,
            nonce = %envelope.nonce,
            num_resources = envelope.resources.len(),
            "received ADS response"
        );
        let mut guard = client.state();
        let st = &mut *guard;
        let Some(resource_type) = st.resource_types.get(&type_url).cloned() else {
            // No nonce state exists for an unknown type; the response is
            // dropped without being NACKed.
            error!(server = %self.server.uri, %type_url, "ignoring ADS response for unknown resource type");
            return None;
        };
        self.seen_response = true;
        set_healthy_locked(st, self.server.key(), self.channel_id);
        self.type_states
            .entry(type_url.clone())
            .or_default()
            .nonce = envelope.nonce.clone();

        let update_time = SystemTime::now();
        let (read_delay, gate_rx) = ReadDelayHandle::new();
        let mut errors: Vec<String> = Vec::new();
        let mut resources_seen: HashMap<String, BTreeSet<ResourceKey>> = HashMap::new();
        let mut num_valid: u64 = 0;
        let mut num_invalid: u64 = 0;

        for (idx, any) in envelope.resources.iter().enumerate() {
            let unwrapped = match client.codec.unwrap_resource(any) {
                Ok(unwrapped) => unwrapped,
                Err(e) => {
                    errors.push(format!("resource index {idx}: {e}"));
                    num_invalid += 1;
                    continue;
                }
            };
            if unwrapped.type_url != type_url {
                errors.push(format!(
                    "resource index {idx}: incorrect resource type \"{}\" (should be \"{}\")",
                    unwrapped.type_url, type_url
                ));
                num_invalid += 1;
                continue;
            }
            let outcome = resource_type.decode(unwrapped.value.clone());
            // A name from the Resource wrapper wins; the decoder's name is
            // the fallback.
            let Some(name_str) = unwrapped.name.clone().or(outcome.name) else {
                // No way of determining the resource name.
                let detail = match &outcome.result {
                    Ok(_) => "cannot determine resource name".to_string(),
                    Err(e) => e.to_string(),
                };
                errors.push(format!("resource index {idx}: {detail}"));
                num_invalid += 1;
                continue;
            };
            let error_prefix = format!("resource index {idx}: {name_str}: ");
            let Ok(parsed) = ResourceName::parse(&name_str, &type_url, client.config.federation)
            else {
                errors.push(format!("{error_prefix}Cannot parse xDS resource name"));
                num_invalid += 1;
                continue;
            };
            // The resource arrived; its does-not-exist timer is moot.
            if let Some(subscription) = self
                .type_states
                .get_mut(&type_url)
                .and_then(|s| s.subscribed.get_mut(&parsed.authority))
                .and_then(|m| m.get_mut(&parsed.key))
            {
                subscription.resource_seen = true;
            }
            let Some(entry) = st
                .authorities
                .get_mut(&parsed.authority)
                .and_then(|a| a.resources.get_mut(&type_url))
                .and_then(|m| m.get_mut(&parsed.key))
            else {
                // Unsolicited resource; not an error.
                continue;
            };
            if resource_type.all_resources_required_in_sotw() {
                resources_seen
                    .entry(parsed.authority.clone())
                    .or_default()
                    .insert(parsed.key.clone());
            }
            if entry.meta.ignored_deletion {
                tracing::info!(
                    server = %self.server.uri,
                    %type_url,
                    name = %name_str,
                    "server returned new version of resource for which a deletion was previously ignored"
                );
                entry.meta.ignored_deletion = false;
            }
            match outcome.result {
                Err(error) => {
                    // A previously accepted value stays cached and visible;
                    // the failure is ambient.
                    let message =
                        client.append_node_id(format!("invalid resource: {error}"));
                    notify_watchers_error(
                        &entry.watchers,
                        Error::Validation(message),
                        &read_delay,
                    );
                    entry.meta.set_nacked(
                        envelope.version_info.clone(),
                        error.to_string(),
                        update_time,
                    );
                    errors.push(format!("{error_prefix}{error}"));
                    num_invalid += 1;
                }
                Ok(resource) => {
                    num_valid += 1;
                    if let Some(old) = &entry.resource
                        && resource_type.resources_equal(old, &resource)
                    {
                        debug!(%type_url, name = %name_str, "resource identical to current, ignoring");
                        continue;
                    }
                    entry.resource = Some(resource.clone());
                    entry.meta.set_acked(
                        unwrapped.value.clone(),
                        envelope.version_info.clone(),
                        update_time,
                    );
                    notify_watchers_changed(&entry.watchers, &resource, &read_delay);
                }
            }
        }

        // State-of-the-world delete semantics: a subscribed resource served
        // by this channel that the response did not carry no longer exists.
        if resource_type.all_resources_required_in_sotw() {
            for (authority_name, authority) in st.authorities.iter_mut() {
                if authority.channels.last().map(String::as_str) != Some(self.server.key()) {
                    continue;
                }
                let Some(by_key) = authority.resources.get_mut(&type_url) else {
                    continue;
                };
                let seen = resources_seen.get(authority_name);
                for (key, entry) in by_key.iter_mut() {
                    if seen.is_some_and(|s| s.contains(key)) {
                        continue;
                    }
                    // A newly requested resource that has never been received
                    // may be absent because the response predates the request
                    // that added it; the request timeout covers that case.
                    if entry.resource.is_none() {
                        continue;
                    }
                    if self.server.ignore_resource_deletion {
                        if !entry.meta.ignored_deletion {
                            error!(
                                server = %self.server.uri,
                                %type_url,
                                name = %format_name(authority_name, &type_url, key),
                                "ignoring resource deletion"
                            );
                            entry.meta.ignored_deletion = true;
                        }
                    } else {
                        entry.resource = None;
                        entry.meta.client_status = ClientResourceStatus::DoesNotExist;
                        notify_watchers_does_not_exist(&entry.watchers, &read_delay);
                    }
                }
            }
        }

        if !errors.is_empty() {
            let details = format!("xDS response validation errors: [{}]", errors.join("; "));
            warn!(
                server = %self.server.uri,
                %type_url,
                version = %envelope.version_info,
                nonce = %envelope.nonce,
                "ADS response invalid, will NACK: {details}"
            );
            if let Some(state) = self.type_states.get_mut(&type_url) {
                state.nack_error = Some(details);
            }
        }
        // Update the accepted version if there were valid resources or the
        // update was empty of errors.
        if num_valid > 0 || errors.is_empty() {
            if let Some(channel) = st.channels.get_mut(self.server.key())
                && channel.id == self.channel_id
            {
                channel
                    .type_versions
                    .insert(type_url.clone(), envelope.version_info.clone());
            }
        }
        debug!(%type_url, num_valid, num_invalid, "processed ADS response");
        drop(guard);
        // Send the ACK/NACK.
        self.buffered_requests.insert(type_url);
        drop(read_delay);
        Some(gate_rx)
    }
}

/// Wait out the read gate from the previous response, then read the next
/// message. Cancel-safe.
async fn gated_recv<S: TransportStream>(
    stream: &mut S,
    gate: &mut Option<oneshot::Receiver<()>>,
) -> Result<Option<Bytes>> {
    if let Some(rx) = gate {
        let _ = rx.await;
        *gate = None;
    }
    stream.recv().await
}
