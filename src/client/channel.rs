//! Per-server channel state and the retryable ADS call task.
//!
//! Each xDS server the client talks to gets exactly one channel, shared by
//! every authority that server serves. The channel owns a background task
//! that keeps at most one ADS stream alive, reconnecting with backoff when
//! the stream dies and replaying the subscription set from the cache on
//! every stream start.

use std::collections::HashMap;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::ads::{AdsCall, CallOutcome};
use crate::client::{ClientInner, ClientState};
use crate::client::config::ServerConfig;
use crate::client::retry::Backoff;
use crate::client::watch::EventSender;
use crate::codec::XdsCodec;
use crate::error::Error;
use crate::resource::ResourceName;
use crate::runtime::Runtime;
use crate::transport::{ADS_METHOD, Transport, TransportBuilder};

/// Mutable channel bookkeeping, guarded by the client mutex.
#[derive(Debug)]
pub(crate) struct ChannelState {
    /// Distinguishes this channel from an earlier, garbage-collected channel
    /// to the same server whose task may still be winding down.
    pub(crate) id: u64,
    pub(crate) server: ServerConfig,
    /// Latched error since the last successful response. `None` means the
    /// channel is considered healthy.
    pub(crate) status: Option<Error>,
    /// Most recent accepted resource version per type URL. Survives stream
    /// restarts.
    pub(crate) type_versions: HashMap<String, String>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    /// Bumped at every stream start and end; resource timers armed under an
    /// older epoch are stale.
    pub(crate) stream_epoch: u64,
}

/// Commands from the client to a channel task.
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    Subscribe {
        type_url: String,
        name: ResourceName,
    },
    Unsubscribe {
        type_url: String,
        name: ResourceName,
        delay_unsubscription: bool,
    },
    ResetBackoff,
    Shutdown,
}

impl<TB, C, R> ClientInner<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec + Clone,
    R: Runtime,
{
    /// Latch a channel error, attempt fallback for the authorities this
    /// channel is active for, and notify the watchers that remain bound to
    /// it.
    pub(crate) fn set_channel_status(&self, server: &ServerConfig, channel_id: u64, err: &Error) {
        let mut guard = self.state();
        let st = &mut *guard;
        let Some(channel) = st.channels.get_mut(server.key()) else {
            // Channel was garbage-collected; nothing to report.
            return;
        };
        if channel.id != channel_id {
            // A stale task must not latch an error on its successor.
            return;
        }
        let message =
            self.append_node_id(format!("xDS channel for server {}: {}", server.uri, err));
        if channel.status.is_none() {
            warn!(server = %server.uri, "xDS channel unhealthy: {message}");
        }
        let error = Error::Connection(message);
        channel.status = Some(error.clone());
        // Authorities whose active (last) channel is this one either fall
        // back to the next server or get their watchers notified.
        let authority_names: Vec<String> = st
            .authorities
            .iter()
            .filter(|(_, a)| a.channels.last().map(String::as_str) == Some(server.key()))
            .map(|(name, _)| name.clone())
            .collect();
        let mut watchers: Vec<EventSender> = Vec::new();
        for authority_name in authority_names {
            if self.maybe_fallback(st, &authority_name) {
                continue;
            }
            if let Some(authority) = st.authorities.get(&authority_name) {
                for by_key in authority.resources.values() {
                    for entry in by_key.values() {
                        watchers.extend(entry.watchers.values().cloned());
                    }
                }
            }
        }
        crate::client::notify_senders_error(&watchers, &error);
    }

    /// Attempt to attach a healthy successor channel for an authority whose
    /// active channel is failing.
    ///
    /// Does nothing if every resource of the authority is already in a
    /// terminal cache state. Returns true iff a channel that is not (yet)
    /// failing was attached.
    pub(crate) fn maybe_fallback(&self, st: &mut ClientState, authority_name: &str) -> bool {
        let Some(authority) = st.authorities.get(authority_name) else {
            return false;
        };
        if !authority.has_uncached_resources() {
            return false;
        }
        let servers = self
            .config
            .servers_for_authority(authority_name)
            .unwrap_or(&self.config.servers)
            .to_vec();
        let start = authority.channels.len();
        for server in servers.iter().skip(start) {
            let key = self.ensure_channel(&mut st.channels, server);
            let Some(authority) = st.authorities.get_mut(authority_name) else {
                return false;
            };
            authority.channels.push(key.clone());
            let subscriptions: Vec<(String, ResourceName)> = authority
                .resources
                .iter()
                .flat_map(|(type_url, by_key)| {
                    by_key.keys().map(|k| {
                        (
                            type_url.clone(),
                            ResourceName {
                                authority: authority_name.to_string(),
                                key: k.clone(),
                            },
                        )
                    })
                })
                .collect();
            let Some(channel) = st.channels.get(&key) else {
                return false;
            };
            for (type_url, name) in subscriptions {
                let _ = channel.cmd_tx.send(ChannelCommand::Subscribe { type_url, name });
            }
            info!(
                authority = authority_name,
                server = %server.uri,
                "added fallback server"
            );
            if channel.status.is_none() {
                return true;
            }
        }
        debug!(authority = authority_name, "no fallback server available");
        false
    }
}

/// Mark a channel healthy and "fall forward": any authority that previously
/// fell back past this channel drops the lower-priority channels again.
pub(crate) fn set_healthy_locked(st: &mut ClientState, server_key: &str, channel_id: u64) {
    match st.channels.get_mut(server_key) {
        Some(channel) if channel.id == channel_id => channel.status = None,
        _ => return,
    }
    for (authority_name, authority) in st.authorities.iter_mut() {
        // Skip if this channel is already the active one.
        if authority.channels.last().map(String::as_str) == Some(server_key) {
            continue;
        }
        if let Some(pos) = authority.channels.iter().position(|k| k == server_key) {
            info!(
                authority = %authority_name,
                server = server_key,
                "falling forward; dropping lower-priority servers"
            );
            authority.channels.truncate(pos + 1);
        }
    }
    crate::client::gc_channels(st);
}

/// The channel task. Owns the transport and drives one ADS stream at a
/// time, with exponential backoff between attempts.
pub(crate) async fn run_channel<TB, C, R>(
    inner: Weak<ClientInner<TB, C, R>>,
    server: ServerConfig,
    channel_id: u64,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
) where
    TB: TransportBuilder,
    C: XdsCodec + Clone,
    R: Runtime,
{
    let Some(client) = inner.upgrade() else { return };
    let runtime = client.runtime.clone();
    let mut backoff = Backoff::new(client.config.retry_policy.clone());
    drop(client);

    let mut transport: Option<TB::Transport> = None;
    loop {
        // Idle until this channel serves at least one subscription. This also
        // prevents deadlock with servers that expect a request before sending
        // response headers: we never open a stream with nothing to send.
        loop {
            let Some(client) = inner.upgrade() else { return };
            if !client.channel_is_current(server.key(), channel_id) {
                return;
            }
            let has_subscriptions = client.channel_serves_subscriptions(server.key());
            drop(client);
            if has_subscriptions {
                break;
            }
            match cmd_rx.recv().await {
                None | Some(ChannelCommand::Shutdown) => return,
                Some(_) => {}
            }
        }

        if transport.is_none() {
            let Some(client) = inner.upgrade() else { return };
            match client.transport_builder.build(&server).await {
                Ok(t) => transport = Some(t),
                Err(e) => {
                    client.set_channel_status(&server, channel_id, &e);
                    drop(client);
                    if !sleep_backoff(&runtime, &mut backoff, &mut cmd_rx).await {
                        return;
                    }
                    continue;
                }
            }
        }
        let Some(transport_ref) = transport.as_ref() else {
            continue;
        };

        // Start a new stream, replaying the subscription set from the cache.
        let Some(client) = inner.upgrade() else { return };
        let epoch = client.bump_stream_epoch(server.key(), channel_id);
        let (mut call, initial_requests, initial_names) =
            AdsCall::start(&client, &server, channel_id, epoch);
        if !call.has_subscribed_resources() {
            // Everything was unsubscribed while we were getting ready.
            drop(client);
            continue;
        }
        debug!(server = %server.uri, "starting ADS call");
        let stream = transport_ref.new_stream(ADS_METHOD, initial_requests).await;
        match stream {
            Err(e) => {
                client.set_channel_status(&server, channel_id, &e);
                drop(client);
                if !sleep_backoff(&runtime, &mut backoff, &mut cmd_rx).await {
                    return;
                }
            }
            Ok(mut stream) => {
                call.on_requests_sent(&client, initial_names);
                drop(client);
                let outcome = call.run(&inner, &mut stream, &mut cmd_rx).await;
                let Some(client) = inner.upgrade() else { return };
                // Invalidate resource timers armed on this stream.
                client.bump_stream_epoch(server.key(), channel_id);
                match outcome {
                    CallOutcome::Shutdown => return,
                    CallOutcome::NoSubscriptions => {
                        // The stream is closed deliberately; a future
                        // subscription starts over with fresh backoff.
                        backoff.reset();
                        drop(client);
                    }
                    CallOutcome::StreamClosed(status) => {
                        debug!(server = %server.uri, "ADS call status received: {status:?}");
                        if call.seen_response() {
                            backoff.reset();
                        } else {
                            let err = Error::Connection(format!(
                                "xDS call failed with no responses received; status: {}",
                                status.map_or_else(|| "OK".to_string(), |e| e.to_string())
                            ));
                            client.set_channel_status(&server, channel_id, &err);
                        }
                        drop(client);
                        if !sleep_backoff(&runtime, &mut backoff, &mut cmd_rx).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Sleep out a backoff delay while still reacting to commands.
///
/// Returns false if the channel should shut down. A `ResetBackoff` command
/// cuts the delay short.
async fn sleep_backoff<R: Runtime>(
    runtime: &R,
    backoff: &mut Backoff,
    cmd_rx: &mut mpsc::UnboundedReceiver<ChannelCommand>,
) -> bool {
    let delay = backoff.next_delay();
    debug!("ADS call attempt failed; retrying in {delay:?}");
    let sleep = runtime.sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(ChannelCommand::Shutdown) => return false,
                Some(ChannelCommand::ResetBackoff) => {
                    backoff.reset();
                    return true;
                }
                // Subscription changes are picked up from the cache when the
                // next stream starts.
                Some(_) => {}
            }
        }
    }
}
