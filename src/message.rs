//! Crate-owned xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the xDS client logic and the codec layer. The codec converts these
//! to/from the wire format (e.g., prost/envoy-types or google-protobuf).

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

/// gRPC status code used in the `error_detail` of a NACK request.
pub(crate) const CODE_INVALID_ARGUMENT: i32 = 3;

/// A discovery request to send to the xDS server.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    /// The version_info provided in the most recent successfully processed
    /// response for this type, or empty for the first request.
    pub version_info: String,
    /// The node making the request. Attached only on the first request of
    /// each stream.
    pub node: Option<Node>,
    /// List of resource names to subscribe to.
    pub resource_names: Vec<String>,
    /// Fully-qualified type URL of the resource being requested,
    /// e.g. `type.googleapis.com/envoy.config.listener.v3.Listener`.
    pub type_url: String,
    /// The nonce from the most recent response of this type on this stream,
    /// or empty before the first response.
    pub response_nonce: String,
    /// Error details if this is a NACK (negative acknowledgment).
    pub error_detail: Option<ErrorDetail>,
}

/// A discovery response from the xDS server.
///
/// The codec strips the `type.googleapis.com/` prefix from `type_url` and
/// from each resource's `type_url` when decoding.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResponse {
    /// The version of the response data.
    pub version_info: String,
    /// The response resources wrapped as Any protos.
    pub resources: Vec<ResourceAny>,
    /// Bare type URL of the resources (prefix stripped).
    pub type_url: String,
    /// Nonce for this response, to be echoed back in the next request.
    pub nonce: String,
}

/// A resource wrapped as google.protobuf.Any.
#[derive(Debug, Clone)]
pub struct ResourceAny {
    /// Bare type URL of the resource (prefix stripped).
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

/// A resource extracted from a response, with the
/// `envoy.service.discovery.v3.Resource` wrapper removed if present.
#[derive(Debug, Clone)]
pub struct UnwrappedResource {
    /// Bare type URL of the inner resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
    /// Resource name from the wrapper, if the resource was wrapped.
    pub name: Option<String>,
}

/// Node identification for the client.
#[derive(Debug, Clone)]
pub struct Node {
    /// An opaque node identifier.
    pub id: Option<String>,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Free-form string metadata attached to the node.
    pub metadata: BTreeMap<String, String>,
    /// Free-form string identifying the client type (e.g., "envoy", "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    ///
    /// Other fields (id, cluster, locality, metadata) can be set using
    /// builder methods.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            id: None,
            cluster: None,
            locality: None,
            metadata: BTreeMap::new(),
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details for NACK responses.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}

/// A load report request sent on the LRS stream.
#[derive(Debug, Clone, Default)]
pub struct LoadStatsRequest {
    /// The node sending the report. Attached only on the first request of
    /// each stream.
    pub node: Option<Node>,
    /// Per-cluster load statistics.
    pub cluster_stats: Vec<ClusterStats>,
}

/// Per-cluster load statistics carried in a [`LoadStatsRequest`].
///
/// Only the stream-lifecycle-relevant fields are modeled here; per-locality
/// counter assembly is the caller's responsibility.
#[derive(Debug, Clone, Default)]
pub struct ClusterStats {
    /// Name of the cluster.
    pub cluster_name: String,
    /// The eds_cluster_config service_name of the cluster, if any.
    pub cluster_service_name: String,
    /// Requests dropped by the cluster over the reporting interval.
    pub total_dropped_requests: u64,
    /// The interval this report covers.
    pub load_report_interval: Option<Duration>,
}

/// A load report response received on the LRS stream.
#[derive(Debug, Clone, Default)]
pub struct LoadStatsResponse {
    /// Clusters the server wants reports for.
    pub clusters: Vec<String>,
    /// If set, report all known clusters and ignore `clusters`.
    pub send_all_clusters: bool,
    /// Interval at which the server wants reports.
    pub load_reporting_interval: Option<Duration>,
}
