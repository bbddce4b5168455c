//! The load-reporting (LRS) call lifecycle.
//!
//! The client sends an initial `LoadStatsRequest` carrying the node, the
//! server answers with the clusters it wants reports for and the reporting
//! interval, and the client then pushes a stats snapshot every interval.
//! Assembling the per-locality counters is the caller's job, via
//! [`LoadStatsProvider`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::client::ClientInner;
use crate::client::config::ServerConfig;
use crate::client::retry::Backoff;
use crate::codec::XdsCodec;
use crate::message::{ClusterStats, LoadStatsRequest};
use crate::runtime::Runtime;
use crate::transport::{LRS_METHOD, Transport, TransportBuilder, TransportStream};

/// The server may not ask for reports more often than this.
const MIN_REPORTING_INTERVAL: Duration = Duration::from_millis(1000);

/// Supplies per-cluster load statistics for LRS reports.
pub trait LoadStatsProvider: Send + Sync + 'static {
    /// Snapshot the current stats. `clusters` is `None` when the server
    /// asked for all clusters, otherwise the clusters to report.
    fn cluster_stats(&self, clusters: Option<&[String]>) -> Vec<ClusterStats>;
}

/// Handle for an active load-reporting call. Dropping it stops reporting.
#[derive(Debug)]
pub struct LrsHandle {
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for LrsHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl<TB, C, R> super::XdsClient<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec + Clone,
    R: Runtime,
{
    /// Start reporting load to the given server.
    ///
    /// The call runs until the returned handle is dropped, reconnecting with
    /// backoff when the stream fails.
    pub fn start_load_reporting(
        &self,
        server: &ServerConfig,
        provider: Arc<dyn LoadStatsProvider>,
    ) -> LrsHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let inner = Arc::downgrade(&self.inner);
        self.inner
            .runtime
            .spawn(run_lrs(inner, server.clone(), provider, stop_rx));
        LrsHandle {
            stop: Some(stop_tx),
        }
    }
}

async fn run_lrs<TB, C, R>(
    inner: Weak<ClientInner<TB, C, R>>,
    server: ServerConfig,
    provider: Arc<dyn LoadStatsProvider>,
    mut stop_rx: oneshot::Receiver<()>,
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
        let Some(client) = inner.upgrade() else { return };
        if transport.is_none() {
            match client.transport_builder.build(&server).await {
                Ok(t) => transport = Some(t),
                Err(e) => {
                    warn!(server = %server.uri, "LRS transport failed: {e}");
                    drop(client);
                    if !sleep_or_stop(&runtime, backoff.next_delay(), &mut stop_rx).await {
                        return;
                    }
                    continue;
                }
            }
        }
        let Some(transport_ref) = transport.as_ref() else {
            continue;
        };
        let initial = LoadStatsRequest {
            node: Some(client.config.node.clone()),
            cluster_stats: Vec::new(),
        };
        let initial_bytes = match client.codec.encode_lrs_request(&initial) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode initial LRS request: {e}");
                return;
            }
        };
        debug!(server = %server.uri, "starting LRS call");
        let stream = transport_ref.new_stream(LRS_METHOD, vec![initial_bytes]).await;
        let codec = client.codec.clone();
        drop(client);
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(server = %server.uri, "LRS stream failed: {e}");
                if !sleep_or_stop(&runtime, backoff.next_delay(), &mut stop_rx).await {
                    return;
                }
                continue;
            }
        };

        // Interval and cluster filter arrive in the first response;
        // `clusters == None` means report all clusters.
        let mut interval: Option<Duration> = None;
        let mut clusters: Option<Vec<String>> = None;
        let mut seen_response = false;
        loop {
            tokio::select! {
                _ = &mut stop_rx => return,
                message = stream.recv() => match message {
                    Ok(Some(bytes)) => match codec.decode_lrs_response(bytes) {
                        Ok(response) => {
                            seen_response = true;
                            let wanted = response
                                .load_reporting_interval
                                .unwrap_or(MIN_REPORTING_INTERVAL);
                            interval = Some(wanted.max(MIN_REPORTING_INTERVAL));
                            clusters = if response.send_all_clusters {
                                None
                            } else {
                                Some(response.clusters)
                            };
                            debug!(
                                server = %server.uri,
                                interval = ?interval,
                                "received LRS response"
                            );
                        }
                        Err(e) => error!("error parsing LRS response ({e}) -- ignoring"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(server = %server.uri, "LRS stream terminated: {e}");
                        break;
                    }
                },
                _ = runtime.sleep(interval.unwrap_or(MIN_REPORTING_INTERVAL)),
                        if interval.is_some() => {
                    let stats = provider.cluster_stats(clusters.as_deref());
                    let request = LoadStatsRequest { node: None, cluster_stats: stats };
                    match codec.encode_lrs_request(&request) {
                        Ok(bytes) => {
                            if stream.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("failed to encode LRS request: {e}"),
                    }
                }
            }
        }
        if seen_response {
            backoff.reset();
        }
        if !sleep_or_stop(&runtime, backoff.next_delay(), &mut stop_rx).await {
            return;
        }
    }
}

async fn sleep_or_stop<R: Runtime>(
    runtime: &R,
    delay: Duration,
    stop_rx: &mut oneshot::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = &mut *stop_rx => false,
        _ = runtime.sleep(delay) => true,
    }
}
