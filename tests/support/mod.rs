//! Test support: an in-process scripted transport and a minimal resource type.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;

use envoy_types::pb::envoy::service::discovery::v3 as discovery_pb;
use envoy_types::pb::google::protobuf::Any;

use xds_ads::resource::DecodeOutcome;
use xds_ads::{
    Error, Resource, Result, ServerConfig, Transport, TransportBuilder, TransportStream,
};

pub const FOO_TYPE_URL: &str = "test.xds.Foo";
pub const FOO_TYPE_URL_FULL: &str = "type.googleapis.com/test.xds.Foo";

/// Wire form of the test resource.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FooProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Validated form of the test resource.
#[derive(Debug, Clone, PartialEq)]
pub struct FooResource {
    pub name: String,
    pub value: String,
}

impl Resource for FooResource {
    const TYPE_URL: &'static str = FOO_TYPE_URL;

    fn decode(bytes: Bytes) -> DecodeOutcome<Self> {
        let proto = match FooProto::decode(bytes) {
            Ok(proto) => proto,
            Err(e) => return DecodeOutcome::unparsable(e.into()),
        };
        if proto.value == "invalid" {
            return DecodeOutcome::invalid(proto.name, Error::Validation("missing endpoint".to_string()));
        }
        DecodeOutcome::valid(
            proto.name.clone(),
            Self {
                name: proto.name,
                value: proto.value,
            },
        )
    }

    fn resources_equal(a: &Self, b: &Self) -> bool {
        a == b
    }
}

pub fn foo_any(name: &str, value: &str) -> Any {
    Any {
        type_url: FOO_TYPE_URL_FULL.to_string(),
        value: FooProto {
            name: name.to_string(),
            value: value.to_string(),
        }
        .encode_to_vec(),
    }
}

pub fn discovery_response(
    version: &str,
    nonce: &str,
    resources: Vec<Any>,
) -> discovery_pb::DiscoveryResponse {
    discovery_pb::DiscoveryResponse {
        version_info: version.to_string(),
        type_url: FOO_TYPE_URL_FULL.to_string(),
        nonce: nonce.to_string(),
        resources,
        ..Default::default()
    }
}

/// One end of a fake ADS stream, held by the test acting as the server.
pub struct FakeStreamHandle {
    pub uri: String,
    requests: mpsc::UnboundedReceiver<Bytes>,
    responses: Option<mpsc::UnboundedSender<Result<Bytes>>>,
}

impl FakeStreamHandle {
    /// Receive the next raw request from the client.
    pub async fn recv_bytes(&mut self) -> Bytes {
        self.requests
            .recv()
            .await
            .expect("stream closed while waiting for a request")
    }

    /// Receive and decode the next DiscoveryRequest from the client.
    pub async fn recv_request(&mut self) -> discovery_pb::DiscoveryRequest {
        let bytes = self.recv_bytes().await;
        discovery_pb::DiscoveryRequest::decode(bytes).expect("malformed DiscoveryRequest")
    }

    pub fn send_response(&self, response: discovery_pb::DiscoveryResponse) {
        if let Some(tx) = &self.responses {
            let _ = tx.send(Ok(response.encode_to_vec().into()));
        }
    }

    pub fn send_bytes(&self, bytes: Bytes) {
        if let Some(tx) = &self.responses {
            let _ = tx.send(Ok(bytes));
        }
    }

    /// Terminate the stream with a transport error.
    pub fn fail(&mut self, message: &str) {
        if let Some(tx) = self.responses.take() {
            let _ = tx.send(Err(Error::Connection(message.to_string())));
        }
    }

    /// Close the stream cleanly.
    pub fn close(&mut self) {
        self.responses = None;
    }

    /// Wait for the client to drop its end of the stream.
    pub async fn closed_by_client(&mut self) {
        while self.requests.recv().await.is_some() {}
    }
}

#[derive(Clone)]
struct Hub {
    streams_tx: mpsc::UnboundedSender<FakeStreamHandle>,
    unreachable: Arc<Mutex<HashSet<String>>>,
}

/// Client-side fake transport for one server.
pub struct FakeTransport {
    uri: String,
    hub: Hub,
}

pub struct FakeStream {
    requests: mpsc::UnboundedSender<Bytes>,
    responses: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl TransportStream for FakeStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.requests.send(request).map_err(|_| Error::StreamClosed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.responses.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Transport for FakeTransport {
    type Stream = FakeStream;

    async fn new_stream(
        &self,
        _method: &'static str,
        initial_requests: Vec<Bytes>,
    ) -> Result<Self::Stream> {
        if self
            .hub
            .unreachable
            .lock()
            .unwrap()
            .contains(&self.uri)
        {
            return Err(Error::Connection("connection refused".to_string()));
        }
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        for request in initial_requests {
            let _ = req_tx.send(request);
        }
        let _ = self.hub.streams_tx.send(FakeStreamHandle {
            uri: self.uri.clone(),
            requests: req_rx,
            responses: Some(resp_tx),
        });
        Ok(FakeStream {
            requests: req_tx,
            responses: resp_rx,
        })
    }
}

#[derive(Clone)]
pub struct FakeTransportBuilder {
    hub: Hub,
}

impl TransportBuilder for FakeTransportBuilder {
    type Transport = FakeTransport;

    async fn build(&self, server: &ServerConfig) -> Result<Self::Transport> {
        Ok(FakeTransport {
            uri: server.uri.clone(),
            hub: self.hub.clone(),
        })
    }
}

/// The test's view of every stream any server accepts.
pub struct FakeControl {
    streams: mpsc::UnboundedReceiver<FakeStreamHandle>,
    unreachable: Arc<Mutex<HashSet<String>>>,
}

impl FakeControl {
    /// The next stream accepted by any server.
    pub async fn next_stream(&mut self) -> FakeStreamHandle {
        self.streams.recv().await.expect("transport dropped")
    }

    /// Make stream creation to a server fail until cleared.
    pub fn set_unreachable(&self, uri: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(uri.to_string());
        } else {
            set.remove(uri);
        }
    }
}

pub fn fake_transport() -> (FakeTransportBuilder, FakeControl) {
    let (streams_tx, streams) = mpsc::unbounded_channel();
    let unreachable = Arc::new(Mutex::new(HashSet::new()));
    let hub = Hub {
        streams_tx,
        unreachable: Arc::clone(&unreachable),
    };
    (
        FakeTransportBuilder { hub },
        FakeControl {
            streams,
            unreachable,
        },
    )
}
