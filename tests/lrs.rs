//! Load-reporting call lifecycle tests.

mod support;

use std::sync::Arc;

use prost::Message;

use envoy_types::pb::envoy::service::load_stats::v3 as load_stats_pb;
use envoy_types::pb::google::protobuf::Duration as ProtoDuration;

use support::fake_transport;
use xds_ads::{
    ClientConfig, ClusterStats, LoadStatsProvider, Node, ProstCodec, ServerConfig, TokioRuntime,
    XdsClient,
};

struct FixedStats;

impl LoadStatsProvider for FixedStats {
    fn cluster_stats(&self, clusters: Option<&[String]>) -> Vec<ClusterStats> {
        assert_eq!(clusters, Some(&["c1".to_string()][..]));
        vec![ClusterStats {
            cluster_name: "c1".to_string(),
            cluster_service_name: "svc".to_string(),
            total_dropped_requests: 3,
            load_report_interval: None,
        }]
    }
}

#[tokio::test(start_paused = true)]
async fn lrs_lifecycle() {
    let (transport, mut control) = fake_transport();
    let node = Node::new("test-agent", "1.0").with_id("node-1");
    let server = ServerConfig::new("http://primary");
    let config = ClientConfig::with_servers(node, vec![server.clone()]);
    let client = XdsClient::builder(config, transport, ProstCodec, TokioRuntime).build();

    let handle = client.start_load_reporting(&server, Arc::new(FixedStats));

    let mut stream = control.next_stream().await;
    let initial = load_stats_pb::LoadStatsRequest::decode(stream.recv_bytes().await).unwrap();
    assert_eq!(initial.node.expect("initial request carries node").id, "node-1");
    assert!(initial.cluster_stats.is_empty());

    stream.send_bytes(
        load_stats_pb::LoadStatsResponse {
            clusters: vec!["c1".to_string()],
            load_reporting_interval: Some(ProtoDuration {
                seconds: 2,
                nanos: 0,
            }),
            ..Default::default()
        }
        .encode_to_vec()
        .into(),
    );

    // After the reporting interval elapses, a stats snapshot goes out.
    let report = load_stats_pb::LoadStatsRequest::decode(stream.recv_bytes().await).unwrap();
    assert!(report.node.is_none());
    assert_eq!(report.cluster_stats.len(), 1);
    assert_eq!(report.cluster_stats[0].cluster_name, "c1");
    assert_eq!(report.cluster_stats[0].total_dropped_requests, 3);

    // Dropping the handle stops the call.
    drop(handle);
    stream.closed_by_client().await;
}
