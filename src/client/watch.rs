//! Resource watcher types.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::resource::DecodedResource;

/// Unique identifier for a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct WatcherId(pub(crate) u64);

/// Ref-counted token gating the next read from the ADS stream.
///
/// Every response-driven notification carries a clone of the handle created
/// for that response. The client does not request the next message from the
/// transport until the last clone has been dropped, providing backpressure
/// to the server while watchers process updates.
///
/// Watchers that want to defer further reads may hold on to the handle.
#[derive(Clone)]
pub struct ReadDelayHandle {
    gate: Option<Arc<ReadGate>>,
}

struct ReadGate {
    tx: Option<oneshot::Sender<()>>,
}

impl Drop for ReadGate {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl ReadDelayHandle {
    /// A handle that does not delay anything. Used for notifications that are
    /// not tied to reading a response (cached replays, channel errors).
    pub fn no_wait() -> Self {
        Self { gate: None }
    }

    /// Create a gating handle along with the receiver that resolves when the
    /// last clone is dropped.
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                gate: Some(Arc::new(ReadGate { tx: Some(tx) })),
            },
            rx,
        )
    }
}

impl fmt::Debug for ReadDelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadDelayHandle")
            .field("gating", &self.gate.is_some())
            .finish()
    }
}

/// Events delivered to resource watchers.
#[derive(Debug)]
pub enum ResourceEvent {
    /// A new version of the resource is available.
    ResourceChanged {
        /// The decoded resource value.
        resource: DecodedResource,
        /// Backpressure token for this response.
        read_delay: ReadDelayHandle,
    },
    /// The server reported (or the request timeout implied) that the
    /// resource does not exist.
    DoesNotExist {
        /// Backpressure token for this response.
        read_delay: ReadDelayHandle,
    },
    /// An error occurred that does not invalidate the previously delivered
    /// resource, but may provide useful information about the state of the
    /// client (validation failure of an update, channel connectivity loss).
    /// The previous version of the resource should still be considered valid.
    AmbientError {
        /// The error.
        error: Error,
        /// Backpressure token for this response.
        read_delay: ReadDelayHandle,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<ResourceEvent>;

/// A watcher for a single resource.
///
/// Call [`next()`](Self::next) to receive resource events. Dropping the
/// watcher cancels the watch; to keep the subscription alive across an
/// immediate re-watch of the same name, use
/// [`cancel_delayed()`](Self::cancel_delayed) instead.
pub struct ResourceWatcher {
    pub(crate) rx: mpsc::UnboundedReceiver<ResourceEvent>,
    pub(crate) cancel: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl ResourceWatcher {
    /// Returns the next resource event.
    ///
    /// Returns `None` when the subscription is closed.
    ///
    /// # Example
    ///
    /// ```ignore
    /// while let Some(event) = watcher.next().await {
    ///     match event {
    ///         ResourceEvent::ResourceChanged { resource, .. } => { /* handle */ }
    ///         ResourceEvent::DoesNotExist { .. } => { /* handle */ }
    ///         ResourceEvent::AmbientError { error, .. } => { /* handle */ }
    ///     }
    /// }
    /// ```
    pub async fn next(&mut self) -> Option<ResourceEvent> {
        self.rx.recv().await
    }

    /// Cancel the watch immediately, sending an unsubscription for the
    /// resource if this was its last watcher.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel(false);
        }
    }

    /// Cancel the watch but suppress the outbound unsubscription request.
    ///
    /// Use this when a new watch for the same resource name is about to be
    /// started, to avoid an unsubscribe/resubscribe round trip.
    pub fn cancel_delayed(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel(true);
        }
    }
}

impl Drop for ResourceWatcher {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel(false);
        }
    }
}

impl fmt::Debug for ResourceWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceWatcher").finish_non_exhaustive()
    }
}
