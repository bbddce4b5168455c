//! gRPC transport backed by tonic.
//!
//! The client core serializes DiscoveryRequest/DiscoveryResponse frames
//! through its own codec, so the gRPC layer here moves opaque bytes: a unit
//! codec hands frames to tonic unchanged in both directions, and one
//! [`GrpcBidiStream`] wraps each live ADS or LRS call.

use crate::client::config::ServerConfig;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportBuilder, TransportStream};
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Channel;
use tonic::{Request, Status, Streaming};

/// Moves already-serialized frames through tonic without reserialization.
#[derive(Debug, Clone, Copy, Default)]
struct RawFrames;

impl Encoder for RawFrames {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Status> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawFrames {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> std::result::Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

impl Codec for RawFrames {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawFrames;
    type Decoder = RawFrames;

    fn encoder(&mut self) -> Self::Encoder {
        *self
    }

    fn decoder(&mut self) -> Self::Decoder {
        *self
    }
}

fn connection_error(e: impl std::fmt::Display) -> Error {
    Error::Connection(e.to_string())
}

/// Transport that opens ADS and LRS streams over a tonic [`Channel`].
#[derive(Clone, Debug)]
pub struct TonicTransport {
    channel: Channel,
}

impl TonicTransport {
    /// Wrap an existing tonic [`Channel`].
    ///
    /// This is the hook for TLS or any other channel-level configuration:
    /// build the channel yourself, then hand it over.
    ///
    /// ```ignore
    /// let tls = ClientTlsConfig::new()
    ///     .ca_certificate(Certificate::from_pem(ca_cert))
    ///     .domain_name("xds.example.com");
    /// let channel = Channel::from_static("https://xds.example.com:443")
    ///     .tls_config(tls)?
    ///     .connect()
    ///     .await?;
    /// let transport = TonicTransport::from_channel(channel);
    /// ```
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Connect to a server with default channel settings.
    pub async fn connect(uri: impl Into<String>) -> Result<Self> {
        let endpoint = Channel::from_shared(uri.into()).map_err(connection_error)?;
        let channel = endpoint.connect().await.map_err(connection_error)?;
        Ok(Self { channel })
    }
}

impl Transport for TonicTransport {
    type Stream = GrpcBidiStream;

    async fn new_stream(
        &self,
        method: &'static str,
        initial_requests: Vec<Bytes>,
    ) -> Result<Self::Stream> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(connection_error)?;
        // Queue the initial requests before tonic first polls the outbound
        // stream, so a server that waits for a request before sending
        // response headers sees one immediately.
        let (requests, outbound) = mpsc::unbounded_channel();
        for frame in initial_requests {
            let _ = requests.send(frame);
        }
        let responses = grpc
            .streaming(
                Request::new(UnboundedReceiverStream::new(outbound)),
                PathAndQuery::from_static(method),
                RawFrames,
            )
            .await
            .map_err(Error::Stream)?;
        Ok(GrpcBidiStream {
            requests,
            responses: responses.into_inner(),
        })
    }
}

/// One live bidirectional gRPC stream.
#[derive(Debug)]
pub struct GrpcBidiStream {
    requests: mpsc::UnboundedSender<Bytes>,
    responses: Streaming<Bytes>,
}

impl TransportStream for GrpcBidiStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.requests.send(request).map_err(|_| Error::StreamClosed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.responses.message().await.map_err(Error::Stream)
    }
}

/// Builds a [`TonicTransport`] per server.
///
/// This is what gives the client its fallback support: every server the
/// client falls back to gets its own connection.
#[derive(Debug, Clone, Default)]
pub struct TonicTransportBuilder;

impl TonicTransportBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self
    }
}

impl TransportBuilder for TonicTransportBuilder {
    type Transport = TonicTransport;

    async fn build(&self, server: &ServerConfig) -> Result<Self::Transport> {
        TonicTransport::connect(server.uri.clone()).await
    }
}
