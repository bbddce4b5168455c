//! Provides abstraction for transport layers.

use crate::client::config::ServerConfig;
use crate::error::Result;
use bytes::Bytes;
use std::future::Future;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// The gRPC method path for the ADS StreamAggregatedResources RPC.
pub const ADS_METHOD: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// The gRPC method path for the LRS StreamLoadStats RPC.
pub const LRS_METHOD: &str = "/envoy.service.load_stats.v3.LoadReportingService/StreamLoadStats";

/// Factory for creating xDS transport streams.
///
/// This abstraction allows for different transport implementations:
/// - Tonic-based gRPC transport
/// - Mock transport for testing
/// - Other custom transports
pub trait Transport: Send + Sync + 'static {
    /// The stream type produced by this transport.
    type Stream: TransportStream;

    /// Creates a new bidirectional stream to the xDS server.
    ///
    /// # Arguments
    ///
    /// * `method` - The full gRPC method path ([`ADS_METHOD`] or [`LRS_METHOD`]).
    /// * `initial_requests` - Requests to send immediately when establishing
    ///   the stream. This is critical for xDS servers that don't send response
    ///   headers until they receive the first request (prevents deadlock).
    ///
    /// This may be called multiple times for reconnection.
    fn new_stream(
        &self,
        method: &'static str,
        initial_requests: Vec<Bytes>,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// A bidirectional byte stream for xDS communication.
///
/// Raw byte transport where the bytes are serialized requests/responses;
/// (de)serialization is handled at the xDS client layer.
pub trait TransportStream: Send + 'static {
    /// Send serialized request bytes to the server.
    ///
    /// Completion of the returned future corresponds to the request having
    /// been handed to the transport; the client core issues at most one send
    /// at a time per stream.
    fn send(&mut self, request: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Receive serialized response bytes from the server.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a response.
    /// - `Ok(None)` - Stream closed normally.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    ///
    /// Must be cancel-safe: the client core polls this inside a select loop.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// Factory for creating transports to xDS servers.
///
/// This abstraction allows the client to create transports on-demand,
/// enabling server fallback: when the active server for an authority fails
/// and uncached resources remain, the client builds a transport to the next
/// server on the list.
///
/// Implementations may hold configuration (e.g., TLS settings) that applies
/// to all servers.
///
/// # Example
///
/// ```ignore
/// use xds_ads::{ServerConfig, TransportBuilder};
///
/// struct MyTransportBuilder { /* ... */ }
///
/// impl TransportBuilder for MyTransportBuilder {
///     type Transport = MyTransport;
///
///     async fn build(&self, server: &ServerConfig) -> Result<Self::Transport> {
///         // Create transport connected to server.uri
///     }
/// }
/// ```
pub trait TransportBuilder: Send + Sync + 'static {
    /// The transport type produced by this builder.
    type Transport: Transport;

    /// Build a transport connected to the given server.
    ///
    /// This may be called multiple times for reconnection or fallback.
    /// Implementations may cache/pool connections internally.
    fn build(&self, server: &ServerConfig) -> impl Future<Output = Result<Self::Transport>> + Send;
}
