//! Prost-based codec using envoy-types.

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::{
    DiscoveryRequest, DiscoveryResponse, LoadStatsRequest, LoadStatsResponse, Node, ResourceAny,
    UnwrappedResource,
};
use bytes::Bytes;
use prost::Message;

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";
const RESOURCE_WRAPPER_TYPE: &str = "envoy.service.discovery.v3.Resource";

/// Client feature advertised on every populated node.
const FEATURE_NO_OVERPROVISIONING: &str = "envoy.lb.does_not_support_overprovisioning";
/// Client feature advertised on ADS requests only.
const FEATURE_RESOURCE_IN_SOTW: &str = "xds.config.resource-in-sotw";

/// A codec that uses prost/envoy-types for serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

fn strip_prefix(type_url: &str) -> &str {
    type_url.strip_prefix(TYPE_URL_PREFIX).unwrap_or(type_url)
}

fn encode_node(node: &Node, ads: bool) -> envoy_types::pb::envoy::config::core::v3::Node {
    use envoy_types::pb::envoy::config::core::v3 as core;
    use envoy_types::pb::google::protobuf::{Struct, Value, value::Kind};

    let mut client_features = vec![FEATURE_NO_OVERPROVISIONING.to_string()];
    if ads {
        client_features.push(FEATURE_RESOURCE_IN_SOTW.to_string());
    }
    let metadata = if node.metadata.is_empty() {
        None
    } else {
        Some(Struct {
            fields: node
                .metadata
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        Value {
                            kind: Some(Kind::StringValue(v.clone())),
                        },
                    )
                })
                .collect(),
        })
    };
    core::Node {
        id: node.id.clone().unwrap_or_default(),
        cluster: node.cluster.clone().unwrap_or_default(),
        metadata,
        locality: node.locality.as_ref().map(|l| core::Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        }),
        user_agent_name: node.user_agent_name.clone(),
        user_agent_version_type: Some(core::node::UserAgentVersionType::UserAgentVersion(
            node.user_agent_version.clone(),
        )),
        client_features,
        ..Default::default()
    }
}

impl XdsCodec for ProstCodec {
    fn encode_request(&self, request: &DiscoveryRequest) -> Result<Bytes> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;
        use envoy_types::pb::google::rpc::Status;

        let proto_request = discovery::DiscoveryRequest {
            version_info: request.version_info.clone(),
            node: request.node.as_ref().map(|n| encode_node(n, true)),
            resource_names: request.resource_names.clone(),
            type_url: request.type_url.clone(),
            response_nonce: request.response_nonce.clone(),
            error_detail: request.error_detail.as_ref().map(|e| Status {
                code: e.code,
                message: e.message.clone(),
                details: vec![],
            }),
            ..Default::default()
        };

        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<DiscoveryResponse> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;

        let proto_response = discovery::DiscoveryResponse::decode(bytes).map_err(Error::Decode)?;

        Ok(DiscoveryResponse {
            version_info: proto_response.version_info,
            resources: proto_response
                .resources
                .into_iter()
                .map(|any| ResourceAny {
                    type_url: strip_prefix(&any.type_url).to_string(),
                    value: any.value.into(),
                })
                .collect(),
            type_url: strip_prefix(&proto_response.type_url).to_string(),
            nonce: proto_response.nonce,
        })
    }

    fn unwrap_resource(&self, resource: &ResourceAny) -> Result<UnwrappedResource> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;

        if resource.type_url != RESOURCE_WRAPPER_TYPE {
            return Ok(UnwrappedResource {
                type_url: resource.type_url.clone(),
                value: resource.value.clone(),
                name: None,
            });
        }
        let wrapper = discovery::Resource::decode(resource.value.clone())
            .map_err(|_| Error::Validation("Can't decode Resource proto wrapper".to_string()))?;
        let inner = wrapper.resource.ok_or_else(|| {
            Error::Validation("No resource present in Resource proto wrapper".to_string())
        })?;
        Ok(UnwrappedResource {
            type_url: strip_prefix(&inner.type_url).to_string(),
            value: inner.value.into(),
            name: if wrapper.name.is_empty() {
                None
            } else {
                Some(wrapper.name)
            },
        })
    }

    fn encode_lrs_request(&self, request: &LoadStatsRequest) -> Result<Bytes> {
        use envoy_types::pb::envoy::config::endpoint::v3 as endpoint;
        use envoy_types::pb::envoy::service::load_stats::v3 as load_stats;
        use envoy_types::pb::google::protobuf::Duration as ProtoDuration;

        let proto_request = load_stats::LoadStatsRequest {
            node: request.node.as_ref().map(|n| encode_node(n, false)),
            cluster_stats: request
                .cluster_stats
                .iter()
                .map(|s| endpoint::ClusterStats {
                    cluster_name: s.cluster_name.clone(),
                    cluster_service_name: s.cluster_service_name.clone(),
                    total_dropped_requests: s.total_dropped_requests,
                    load_report_interval: s.load_report_interval.map(|d| ProtoDuration {
                        seconds: d.as_secs() as i64,
                        nanos: d.subsec_nanos() as i32,
                    }),
                    ..Default::default()
                })
                .collect(),
        };

        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_lrs_response(&self, bytes: Bytes) -> Result<LoadStatsResponse> {
        use envoy_types::pb::envoy::service::load_stats::v3 as load_stats;

        let proto_response = load_stats::LoadStatsResponse::decode(bytes).map_err(Error::Decode)?;

        Ok(LoadStatsResponse {
            clusters: proto_response.clusters,
            send_all_clusters: proto_response.send_all_clusters,
            load_reporting_interval: proto_response.load_reporting_interval.and_then(|d| {
                let seconds = u64::try_from(d.seconds).ok()?;
                let nanos = u32::try_from(d.nanos).ok()?;
                Some(std::time::Duration::new(seconds, nanos))
            }),
        })
    }
}
