//! End-to-end tests of the ADS client against a scripted in-process
//! transport.

mod support;

use std::sync::Arc;

use support::{
    FOO_TYPE_URL_FULL, FakeControl, FooResource, discovery_response, fake_transport, foo_any,
};
use xds_ads::{
    ClientConfig, Node, ProstCodec, ResourceEvent, ResourceWatcher, ServerConfig, TokioRuntime,
    XdsClient,
};

type TestClient =
    XdsClient<support::FakeTransportBuilder, ProstCodec, TokioRuntime>;

fn new_client(servers: Vec<ServerConfig>) -> (TestClient, FakeControl) {
    let (transport, control) = fake_transport();
    let node = Node::new("test-agent", "1.0").with_id("node-1");
    let config = ClientConfig::with_servers(node, servers);
    let client = XdsClient::builder(config, transport, ProstCodec, TokioRuntime).build();
    (client, control)
}

fn single_server_client() -> (TestClient, FakeControl) {
    new_client(vec![ServerConfig::new("http://primary")])
}

async fn expect_changed(watcher: &mut ResourceWatcher) -> Arc<FooResource> {
    match watcher.next().await.expect("watcher closed") {
        ResourceEvent::ResourceChanged { resource, .. } => {
            resource.downcast::<FooResource>().expect("wrong type")
        }
        other => panic!("expected ResourceChanged, got {other:?}"),
    }
}

async fn expect_does_not_exist(watcher: &mut ResourceWatcher) {
    match watcher.next().await.expect("watcher closed") {
        ResourceEvent::DoesNotExist { .. } => {}
        other => panic!("expected DoesNotExist, got {other:?}"),
    }
}

async fn expect_error(watcher: &mut ResourceWatcher) -> String {
    match watcher.next().await.expect("watcher closed") {
        ResourceEvent::AmbientError { error, .. } => error.to_string(),
        other => panic!("expected AmbientError, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn basic_ack() {
    let (client, mut control) = single_server_client();
    let mut watcher = client.watch::<FooResource>("foo");

    let mut stream = control.next_stream().await;
    assert_eq!(stream.uri, "http://primary");
    let request = stream.recv_request().await;
    assert_eq!(request.type_url, FOO_TYPE_URL_FULL);
    assert_eq!(request.resource_names, vec!["foo".to_string()]);
    assert_eq!(request.version_info, "");
    assert_eq!(request.response_nonce, "");
    assert!(request.error_detail.is_none());
    let node = request.node.expect("first request must carry the node");
    assert_eq!(node.id, "node-1");

    stream.send_response(discovery_response("1", "n1", vec![foo_any("foo", "v1")]));

    let foo = expect_changed(&mut watcher).await;
    assert_eq!(foo.value, "v1");

    let ack = stream.recv_request().await;
    assert_eq!(ack.version_info, "1");
    assert_eq!(ack.response_nonce, "n1");
    assert!(ack.error_detail.is_none());
    assert!(ack.node.is_none(), "node is only sent once per stream");
}

#[tokio::test(start_paused = true)]
async fn nack_on_invalid_resource() {
    let (client, mut control) = single_server_client();
    let mut watcher = client.watch::<FooResource>("bar");

    let mut stream = control.next_stream().await;
    stream.recv_request().await;

    stream.send_response(discovery_response("7", "n7", vec![foo_any("bar", "invalid")]));

    let message = expect_error(&mut watcher).await;
    assert!(message.contains("invalid resource: missing endpoint"), "{message}");
    assert!(message.contains("(node ID:node-1)"), "{message}");

    let nack = stream.recv_request().await;
    assert_eq!(nack.response_nonce, "n7");
    assert_eq!(nack.version_info, "", "no version was ever accepted");
    let detail = nack.error_detail.expect("NACK must carry error_detail");
    assert_eq!(detail.code, 3); // INVALID_ARGUMENT
    assert!(detail.message.contains("missing endpoint"), "{}", detail.message);
}

#[tokio::test(start_paused = true)]
async fn nack_does_not_invalidate_cached_value() {
    let (client, mut control) = single_server_client();
    let mut watcher = client.watch::<FooResource>("foo");

    let mut stream = control.next_stream().await;
    stream.recv_request().await;
    stream.send_response(discovery_response("1", "n1", vec![foo_any("foo", "v1")]));
    assert_eq!(expect_changed(&mut watcher).await.value, "v1");
    stream.recv_request().await;

    // A bad update is reported as an ambient error; the next request NACKs
    // with the previously accepted version.
    stream.send_response(discovery_response("2", "n2", vec![foo_any("foo", "invalid")]));
    let message = expect_error(&mut watcher).await;
    assert!(message.contains("invalid resource"), "{message}");
    let nack = stream.recv_request().await;
    assert_eq!(nack.version_info, "1");
    assert_eq!(nack.response_nonce, "n2");
    assert!(nack.error_detail.is_some());

    // A new watcher still sees the cached value first.
    let mut watcher2 = client.watch::<FooResource>("foo");
    assert_eq!(expect_changed(&mut watcher2).await.value, "v1");
}

#[tokio::test(start_paused = true)]
async fn resource_timeout_reports_does_not_exist() {
    let (client, mut control) = single_server_client();
    let mut watcher = client.watch::<FooResource>("r1");

    let mut stream = control.next_stream().await;
    stream.recv_request().await;

    // The server stays silent; the 15s request timeout fires.
    expect_does_not_exist(&mut watcher).await;

    // A later response transitions the resource back into existence.
    stream.send_response(discovery_response("1", "n1", vec![foo_any("r1", "v1")]));
    assert_eq!(expect_changed(&mut watcher).await.value, "v1");
}

#[tokio::test(start_paused = true)]
async fn sotw_omission_deletes_resource() {
    let (client, mut control) = single_server_client();
    let mut watcher_a = client.watch::<FooResource>("a");

    let mut stream = control.next_stream().await;
    let request = stream.recv_request().await;
    assert_eq!(request.resource_names, vec!["a".to_string()]);

    let mut watcher_b = client.watch::<FooResource>("b");
    let request = stream.recv_request().await;
    let mut names = request.resource_names.clone();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

    stream.send_response(discovery_response(
        "1",
        "n1",
        vec![foo_any("a", "v1"), foo_any("b", "v1")],
    ));
    assert_eq!(expect_changed(&mut watcher_a).await.value, "v1");
    assert_eq!(expect_changed(&mut watcher_b).await.value, "v1");
    stream.recv_request().await;

    // Second response omits b: its watcher sees a deletion, a's watcher sees
    // nothing (the redelivered value is identical).
    stream.send_response(discovery_response("2", "n2", vec![foo_any("a", "v1")]));
    expect_does_not_exist(&mut watcher_b).await;
    stream.recv_request().await;

    // a's next event is the v3 update, proving no spurious notification was
    // delivered in between.
    stream.send_response(discovery_response("3", "n3", vec![foo_any("a", "v3")]));
    assert_eq!(expect_changed(&mut watcher_a).await.value, "v3");
}

#[tokio::test(start_paused = true)]
async fn stream_restart_replays_subscriptions() {
    let (client, mut control) = single_server_client();
    let mut watcher_a = client.watch::<FooResource>("a");
    let mut watcher_b = client.watch::<FooResource>("b");

    let mut stream = control.next_stream().await;
    // Drain requests until both names are subscribed.
    loop {
        let request = stream.recv_request().await;
        if request.resource_names.len() == 2 {
            break;
        }
    }
    stream.send_response(discovery_response(
        "5",
        "n5",
        vec![foo_any("a", "v5"), foo_any("b", "v5")],
    ));
    assert_eq!(expect_changed(&mut watcher_a).await.value, "v5");
    assert_eq!(expect_changed(&mut watcher_b).await.value, "v5");
    stream.recv_request().await;

    // Stream dies; after backoff the client reconnects and replays both
    // subscriptions with the last accepted version and a fresh nonce.
    stream.fail("stream reset");

    let mut stream = control.next_stream().await;
    let request = stream.recv_request().await;
    let mut names = request.resource_names.clone();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(request.version_info, "5");
    assert_eq!(request.response_nonce, "");
    assert!(request.node.is_some());

    // The same resources again: accepted, but no watcher notifications.
    stream.send_response(discovery_response(
        "5",
        "n1",
        vec![foo_any("a", "v5"), foo_any("b", "v5")],
    ));
    let ack = stream.recv_request().await;
    assert_eq!(ack.version_info, "5");
    assert_eq!(ack.response_nonce, "n1");

    // The next thing either watcher sees is a genuine change.
    stream.send_response(discovery_response("6", "n2", vec![foo_any("a", "v6"), foo_any("b", "v5")]));
    assert_eq!(expect_changed(&mut watcher_a).await.value, "v6");
}

#[tokio::test(start_paused = true)]
async fn fallback_and_fall_forward() {
    let (client, mut control) = new_client(vec![
        ServerConfig::new("http://p1"),
        ServerConfig::new("http://p2"),
    ]);
    let mut watcher = client.watch::<FooResource>("foo");

    let mut p1_stream = control.next_stream().await;
    assert_eq!(p1_stream.uri, "http://p1");
    p1_stream.recv_request().await;

    // p1 fails before any response: with an uncached resource outstanding,
    // the client falls back to p2.
    p1_stream.fail("connection reset");

    let mut p2_stream = control.next_stream().await;
    assert_eq!(p2_stream.uri, "http://p2");
    let request = p2_stream.recv_request().await;
    assert_eq!(request.resource_names, vec!["foo".to_string()]);

    p2_stream.send_response(discovery_response("1", "n1", vec![foo_any("foo", "from-p2")]));
    assert_eq!(expect_changed(&mut watcher).await.value, "from-p2");

    // p1's retry loop reconnects; it stays in the list ahead of p2.
    let mut p1_retry = control.next_stream().await;
    assert_eq!(p1_retry.uri, "http://p1");
    p1_retry.recv_request().await;

    // When p1 delivers a response, the client falls forward and drops p2.
    p1_retry.send_response(discovery_response("9", "m1", vec![foo_any("foo", "from-p1")]));
    assert_eq!(expect_changed(&mut watcher).await.value, "from-p1");
    p2_stream.closed_by_client().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_primary_falls_back() {
    let (client, mut control) = new_client(vec![
        ServerConfig::new("http://p1"),
        ServerConfig::new("http://p2"),
    ]);
    control.set_unreachable("http://p1", true);
    let mut watcher = client.watch::<FooResource>("foo");

    // p1 never accepts a stream; the first stream the transport yields is
    // the fallback connection to p2.
    let mut p2_stream = control.next_stream().await;
    assert_eq!(p2_stream.uri, "http://p2");
    let request = p2_stream.recv_request().await;
    assert_eq!(request.resource_names, vec!["foo".to_string()]);

    p2_stream.send_response(discovery_response("1", "n1", vec![foo_any("foo", "from-p2")]));
    assert_eq!(expect_changed(&mut watcher).await.value, "from-p2");
}

#[tokio::test(start_paused = true)]
async fn channel_error_is_latched_for_new_watchers() {
    let (client, mut control) = single_server_client();
    let mut watcher = client.watch::<FooResource>("foo");

    let mut stream = control.next_stream().await;
    stream.recv_request().await;
    // Single server: no fallback is possible, so watchers hear about the
    // failure.
    stream.fail("connection refused");

    let message = expect_error(&mut watcher).await;
    assert!(message.contains("xDS channel for server http://primary"), "{message}");
    assert!(message.contains("(node ID:node-1)"), "{message}");

    // A watcher started while the channel is down gets the latched status.
    let mut watcher2 = client.watch::<FooResource>("foo");
    let message = expect_error(&mut watcher2).await;
    assert!(message.contains("xDS channel for server http://primary"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn cached_value_replayed_to_new_watcher() {
    let (client, mut control) = single_server_client();
    let mut watcher = client.watch::<FooResource>("foo");

    let mut stream = control.next_stream().await;
    stream.recv_request().await;
    stream.send_response(discovery_response("1", "n1", vec![foo_any("foo", "v1")]));
    assert_eq!(expect_changed(&mut watcher).await.value, "v1");

    let mut watcher2 = client.watch::<FooResource>("foo");
    assert_eq!(expect_changed(&mut watcher2).await.value, "v1");
}

#[tokio::test(start_paused = true)]
async fn last_unsubscription_closes_the_stream() {
    let (client, mut control) = single_server_client();
    let watcher = client.watch::<FooResource>("foo");

    let mut stream = control.next_stream().await;
    stream.recv_request().await;

    watcher.cancel();
    // No unsubscription request goes out for the last resource; the stream
    // is torn down instead.
    stream.closed_by_client().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_authority_reports_error() {
    let (client, _control) = single_server_client();
    let mut watcher = client.watch::<FooResource>("xdstp://unknown/test.xds.Foo/x");
    let message = expect_error(&mut watcher).await;
    assert!(
        message.contains("authority \"unknown\" not present in bootstrap config"),
        "{message}"
    );
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "two different implementations")]
async fn conflicting_type_registration_panics() {
    use bytes::Bytes;
    use xds_ads::Resource;
    use xds_ads::resource::DecodeOutcome;

    // A second resource type claiming the same type URL.
    #[derive(Debug, Clone, PartialEq)]
    struct OtherFoo;

    impl Resource for OtherFoo {
        const TYPE_URL: &'static str = support::FOO_TYPE_URL;

        fn decode(_bytes: Bytes) -> DecodeOutcome<Self> {
            DecodeOutcome::valid("x", Self)
        }

        fn resources_equal(a: &Self, b: &Self) -> bool {
            a == b
        }
    }

    let (client, _control) = single_server_client();
    let _watcher = client.watch::<FooResource>("a");
    let _watcher2 = client.watch::<OtherFoo>("b");
}

#[tokio::test(start_paused = true)]
async fn unsubscription_is_sent_for_non_last_resource() {
    let (client, mut control) = single_server_client();
    let _watcher_a = client.watch::<FooResource>("a");

    let mut stream = control.next_stream().await;
    stream.recv_request().await;

    let watcher_b = client.watch::<FooResource>("b");
    let request = stream.recv_request().await;
    assert_eq!(request.resource_names.len(), 2);

    watcher_b.cancel();
    let request = stream.recv_request().await;
    assert_eq!(request.resource_names, vec!["a".to_string()]);
}
