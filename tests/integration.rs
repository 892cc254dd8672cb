//! Integration tests for the broker core.
//!
//! These drive the embedding API the way a transport layer would: connect,
//! subscribe, publish, pump the outbound channel, acknowledge, disconnect.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use postmq::broker::{Broker, DeliveryStatus, SubscribeError};
use postmq::config::{Config, StorageBackendKind};
use postmq::message::{Publish, QoS};
use postmq::session::OutboundMessage;
use postmq::topic::Topic;

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn memory_config() -> Config {
    Config::default()
}

fn fjall_config(path: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackendKind::Fjall;
    config.storage.fjall.path = path.to_path_buf();
    config
}

fn publish(topic: &str, qos: QoS, payload: &'static [u8]) -> Publish {
    Publish::new(
        Topic::name(topic).unwrap(),
        qos,
        Bytes::from_static(payload),
        false,
    )
}

fn retained_publish(topic: &str, qos: QoS, payload: &'static [u8]) -> Publish {
    Publish::new(
        Topic::name(topic).unwrap(),
        qos,
        Bytes::from_static(payload),
        true,
    )
}

async fn recv(handle: &mut postmq::broker::ClientHandle) -> OutboundMessage {
    timeout(Duration::from_secs(5), handle.outbound.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed")
}

#[tokio::test]
async fn subscribe_then_publish_delivers_at_min_qos() {
    init_logging();
    let broker = Broker::open(memory_config()).await.unwrap();

    let mut subscriber = broker.connect("client-a", false).await.unwrap();
    broker
        .subscribe("client-a", "sensors/+/temp", QoS::AtLeastOnce)
        .await
        .unwrap();

    let _publisher = broker.connect("client-b", true).await.unwrap();
    let results = broker
        .internal_publish(
            publish("sensors/room1/temp", QoS::AtLeastOnce, b"21.5").from_client("client-b"),
        )
        .await;
    assert_eq!(results.delivered(), 1);
    assert_eq!(results.dropped(), 0);

    let message = recv(&mut subscriber).await;
    assert_eq!(message.topic.as_str(), "sensors/room1/temp");
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert_eq!(message.payload.as_ref(), b"21.5");
    assert!(!message.retain);
}

#[tokio::test]
async fn delivery_qos_never_exceeds_subscription_qos() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let mut subscriber = broker.connect("sub0", false).await.unwrap();
    broker.subscribe("sub0", "a/#", QoS::AtMostOnce).await.unwrap();

    broker
        .internal_publish(publish("a/b", QoS::ExactlyOnce, b"x"))
        .await;

    let message = recv(&mut subscriber).await;
    assert_eq!(message.qos, QoS::AtMostOnce);
}

#[tokio::test]
async fn publish_without_subscribers_routes_nowhere() {
    let broker = Broker::open(memory_config()).await.unwrap();
    let results = broker
        .internal_publish(publish("nobody/home", QoS::AtLeastOnce, b"x"))
        .await;
    assert!(results.outcomes.is_empty());
}

#[tokio::test]
async fn offline_persistent_session_queues_in_order() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let handle = broker.connect("sticky", false).await.unwrap();
    broker.subscribe("sticky", "jobs/#", QoS::AtLeastOnce).await.unwrap();
    drop(handle);
    broker.disconnect("sticky").await.unwrap();

    for payload in [b"one" as &[u8], b"two", b"three"] {
        let results = broker
            .internal_publish(Publish::new(
                Topic::name("jobs/build").unwrap(),
                QoS::AtLeastOnce,
                Bytes::copy_from_slice(payload),
                false,
            ))
            .await;
        assert_eq!(results.queued(), 1);
    }

    let mut handle = broker.connect("sticky", false).await.unwrap();
    assert!(handle.session_present);
    assert_eq!(recv(&mut handle).await.payload.as_ref(), b"one");
    assert_eq!(recv(&mut handle).await.payload.as_ref(), b"two");
    assert_eq!(recv(&mut handle).await.payload.as_ref(), b"three");
}

#[tokio::test]
async fn clean_session_disconnect_evicts_everything() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let _handle = broker.connect("fleeting", true).await.unwrap();
    broker.subscribe("fleeting", "x/+", QoS::AtLeastOnce).await.unwrap();
    assert_eq!(broker.subscription_count(), 1);

    broker.disconnect("fleeting").await.unwrap();
    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.subscription_count(), 0);

    let results = broker.internal_publish(publish("x/1", QoS::AtLeastOnce, b"x")).await;
    assert!(results.outcomes.is_empty());
}

#[tokio::test]
async fn retained_message_replayed_to_new_subscriber() {
    let broker = Broker::open(memory_config()).await.unwrap();

    broker
        .internal_publish(retained_publish("state/lamp", QoS::AtLeastOnce, b"on"))
        .await;

    let mut late = broker.connect("late", false).await.unwrap();
    broker.subscribe("late", "state/+", QoS::ExactlyOnce).await.unwrap();

    let message = recv(&mut late).await;
    assert_eq!(message.topic.as_str(), "state/lamp");
    assert_eq!(message.payload.as_ref(), b"on");
    assert!(message.retain);
    // min(stored qos 1, subscription qos 2)
    assert_eq!(message.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn empty_retained_payload_clears_the_topic() {
    let broker = Broker::open(memory_config()).await.unwrap();

    broker
        .internal_publish(retained_publish("state/lamp", QoS::AtLeastOnce, b"on"))
        .await;
    broker
        .internal_publish(retained_publish("state/lamp", QoS::AtLeastOnce, b""))
        .await;

    let mut late = broker.connect("late", false).await.unwrap();
    broker.subscribe("late", "state/#", QoS::AtLeastOnce).await.unwrap();

    assert!(
        timeout(Duration::from_millis(200), late.outbound.recv())
            .await
            .is_err(),
        "cleared retained topic must not replay"
    );
}

#[tokio::test]
async fn reconnect_takes_over_the_live_transport() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let mut first = broker.connect("dual", false).await.unwrap();
    broker.subscribe("dual", "t", QoS::AtLeastOnce).await.unwrap();

    let mut second = broker.connect("dual", false).await.unwrap();
    assert!(second.session_present);

    // The superseded handle's channel closes
    assert!(first.outbound.recv().await.is_none());

    broker.internal_publish(publish("t", QoS::AtLeastOnce, b"x")).await;
    assert_eq!(recv(&mut second).await.payload.as_ref(), b"x");
}

#[tokio::test]
async fn acknowledgment_opens_the_inflight_window() {
    let mut config = memory_config();
    config.session.inflight_window = 1;
    let broker = Broker::open(config).await.unwrap();

    let mut handle = broker.connect("acks", false).await.unwrap();
    broker.subscribe("acks", "q", QoS::AtLeastOnce).await.unwrap();

    broker.internal_publish(publish("q", QoS::AtLeastOnce, b"first")).await;
    broker.internal_publish(publish("q", QoS::AtLeastOnce, b"second")).await;

    let first = recv(&mut handle).await;
    assert_eq!(first.payload.as_ref(), b"first");
    assert!(
        timeout(Duration::from_millis(200), handle.outbound.recv())
            .await
            .is_err(),
        "window of one must hold back the second message"
    );

    assert!(broker.acknowledge("acks", first.message_id).await.unwrap());
    assert_eq!(recv(&mut handle).await.payload.as_ref(), b"second");
}

#[tokio::test]
async fn system_topics_do_not_match_root_wildcards() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let mut all = broker.connect("all", false).await.unwrap();
    broker.subscribe("all", "#", QoS::AtLeastOnce).await.unwrap();

    let mut sys = broker.connect("sys", false).await.unwrap();
    broker.subscribe("sys", "$SYS/#", QoS::AtLeastOnce).await.unwrap();

    let results = broker
        .internal_publish(publish("$SYS/broker/uptime", QoS::AtMostOnce, b"42"))
        .await;
    assert_eq!(results.outcomes.len(), 1);

    assert_eq!(recv(&mut sys).await.payload.as_ref(), b"42");
    assert!(
        timeout(Duration::from_millis(200), all.outbound.recv())
            .await
            .is_err(),
        "# must not match $SYS topics"
    );
}

#[tokio::test]
async fn malformed_filter_is_rejected_before_the_directory() {
    let broker = Broker::open(memory_config()).await.unwrap();
    let _handle = broker.connect("c", true).await.unwrap();

    let result = broker.subscribe("c", "bad/#/filter", QoS::AtMostOnce).await;
    assert!(matches!(result, Err(SubscribeError::InvalidFilter(_))));
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn one_slow_subscriber_does_not_abort_fanout() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let gone = broker.connect("gone", false).await.unwrap();
    broker.subscribe("gone", "mix", QoS::AtLeastOnce).await.unwrap();
    let mut healthy = broker.connect("healthy", false).await.unwrap();
    broker.subscribe("healthy", "mix", QoS::AtLeastOnce).await.unwrap();

    drop(gone);
    broker.disconnect("gone").await.unwrap();

    let results = broker.internal_publish(publish("mix", QoS::AtMostOnce, b"x")).await;
    // Both subscribers get an outcome: the offline one parks, the live one
    // delivers; neither aborts the other
    assert_eq!(results.outcomes.len(), 2);
    assert_eq!(results.queued(), 1);
    assert_eq!(results.delivered(), 1);
    assert_eq!(recv(&mut healthy).await.payload.as_ref(), b"x");
}

#[tokio::test]
async fn duplicate_subscription_collapses_to_one_delivery() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let mut handle = broker.connect("multi", false).await.unwrap();
    broker.subscribe("multi", "a/b", QoS::AtMostOnce).await.unwrap();
    broker.subscribe("multi", "a/+", QoS::AtLeastOnce).await.unwrap();

    let results = broker.internal_publish(publish("a/b", QoS::AtLeastOnce, b"x")).await;
    // Two filters match, one client: one delivery at the highest
    // subscription QoS
    assert_eq!(results.outcomes.len(), 1);
    assert_eq!(results.outcomes[0].qos, QoS::AtLeastOnce);

    let message = recv(&mut handle).await;
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert!(
        timeout(Duration::from_millis(200), handle.outbound.recv())
            .await
            .is_err(),
        "one publish must reach a client once"
    );
}

#[tokio::test]
async fn qos0_parks_for_offline_persistent_sessions() {
    let broker = Broker::open(memory_config()).await.unwrap();

    let handle = broker.connect("zero", false).await.unwrap();
    broker.subscribe("zero", "z", QoS::AtMostOnce).await.unwrap();
    drop(handle);
    broker.disconnect("zero").await.unwrap();

    let results = broker.internal_publish(publish("z", QoS::AtMostOnce, b"x")).await;
    assert_eq!(
        results.outcomes[0].status,
        DeliveryStatus::Queued,
        "persistent offline sessions park even QoS 0"
    );

    // Once the session is gone entirely, nothing matches any more
    broker.connect("zero", true).await.unwrap();
    broker.disconnect("zero").await.unwrap();
    let results = broker.internal_publish(publish("z", QoS::AtMostOnce, b"x")).await;
    assert!(results.outcomes.is_empty());
}

#[tokio::test]
async fn fjall_backend_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(fjall_config(dir.path())).await.unwrap();
        let handle = broker.connect("durable", false).await.unwrap();
        broker
            .subscribe("durable", "facts/#", QoS::AtLeastOnce)
            .await
            .unwrap();
        drop(handle);
        broker.disconnect("durable").await.unwrap();

        for payload in [b"1" as &[u8], b"2", b"3", b"4", b"5"] {
            let results = broker
                .internal_publish(Publish::new(
                    Topic::name("facts/n").unwrap(),
                    QoS::AtLeastOnce,
                    Bytes::copy_from_slice(payload),
                    false,
                ))
                .await;
            assert_eq!(results.queued(), 1);
        }
        broker.shutdown().await.unwrap();
    }

    let broker = Broker::open(fjall_config(dir.path())).await.unwrap();
    // The offline session and its subscription came back from storage
    assert_eq!(broker.session_count(), 1);
    assert_eq!(broker.subscription_count(), 1);

    let mut handle = broker.connect("durable", false).await.unwrap();
    assert!(handle.session_present);
    for expected in [b"1" as &[u8], b"2", b"3", b"4", b"5"] {
        assert_eq!(recv(&mut handle).await.payload.as_ref(), expected);
    }
}

#[tokio::test]
async fn fjall_retained_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(fjall_config(dir.path())).await.unwrap();
        broker
            .internal_publish(retained_publish("state/door", QoS::AtLeastOnce, b"shut"))
            .await;
        broker.shutdown().await.unwrap();
    }

    let broker = Broker::open(fjall_config(dir.path())).await.unwrap();
    let mut handle = broker.connect("viewer", true).await.unwrap();
    broker.subscribe("viewer", "state/+", QoS::AtLeastOnce).await.unwrap();

    let message = recv(&mut handle).await;
    assert_eq!(message.payload.as_ref(), b"shut");
    assert!(message.retain);
}
