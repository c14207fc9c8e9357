use std::time::Duration;

use common::{broker, node, node_with_tcp, port};
use fleetmq::{Error, QoS, Transport, TRANSPORT_ALL, TRANSPORT_MQTT, TRANSPORT_TCP};
use tokio::sync::mpsc;
use tokio::time::{self, timeout};

mod common;

#[tokio::test]
async fn mqtt_publish_subscribe_round_trips() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let subscriber = node(broker_port, "sub-1").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe("orders/#", Transport::Mqtt, QoS::AtLeastOnce, move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();

    let publisher = node(broker_port, "pub-1").await.unwrap();
    publisher
        .publish("orders/created", "hello", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert_eq!(msg.topic, "orders/created");
    assert_eq!(&msg.payload[..], b"hello");
    assert_eq!(msg.transport, Transport::Mqtt);
}

#[tokio::test]
async fn tcp_fast_path_round_trips() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let subscriber = node_with_tcp(broker_port, "tcp-sub-1", false).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe("alerts/#", Transport::Tcp, QoS::AtLeastOnce, move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();
    time::sleep(Duration::from_millis(200)).await;

    let publisher = node_with_tcp(broker_port, "tcp-pub-1", false).await.unwrap();
    time::sleep(Duration::from_millis(200)).await;

    publisher.publish("alerts/fire", "x", QoS::AtLeastOnce, false).await.unwrap();

    let msg = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timeout waiting for tcp fast-path delivery")
        .expect("channel closed");
    assert_eq!(msg.topic, "alerts/fire");
    assert_eq!(msg.transport, Transport::Tcp);
}

#[tokio::test]
async fn publish_with_reply_delivers_every_reply_then_auto_unsubscribes() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let responder = node(broker_port, "responder-1").await.unwrap();
    responder
        .subscribe("req/echo", Transport::Mqtt, QoS::AtLeastOnce, {
            let responder = responder.clone();
            move |msg| {
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Some(mut seq) = fleetmq::ReplySequence::from_message(&msg) {
                        responder
                            .send_reply(&mut seq, "first", QoS::AtLeastOnce, false, false)
                            .await
                            .unwrap();
                        responder
                            .send_reply(&mut seq, "last", QoS::AtLeastOnce, false, true)
                            .await
                            .unwrap();
                    }
                });
            }
        })
        .await
        .unwrap();
    time::sleep(Duration::from_millis(100)).await;

    let requester = node(broker_port, "requester-1").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    requester
        .publish_with_reply(
            "req/echo",
            "ping",
            QoS::AtLeastOnce,
            false,
            Transport::Mqtt,
            "corr-1",
            move |msg| {
                let _ = tx.send(msg);
            },
        )
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&first.payload[..], b"first");
    assert!(!first.is_end_sequence);

    let last = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&last.payload[..], b"last");
    assert!(last.is_end_sequence);
}

#[tokio::test]
async fn publish_with_reply_sync_returns_the_final_reply() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let responder = node(broker_port, "responder-2").await.unwrap();
    responder
        .subscribe("req/sync", Transport::Mqtt, QoS::AtLeastOnce, {
            let responder = responder.clone();
            move |msg| {
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Some(mut seq) = fleetmq::ReplySequence::from_message(&msg) {
                        responder
                            .send_reply(&mut seq, "pong", QoS::AtLeastOnce, false, true)
                            .await
                            .unwrap();
                    }
                });
            }
        })
        .await
        .unwrap();
    time::sleep(Duration::from_millis(100)).await;

    let requester = node(broker_port, "requester-2").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reply = requester
        .publish_with_reply_sync(
            "req/sync",
            "ping",
            QoS::AtLeastOnce,
            false,
            Transport::Mqtt,
            "corr-2",
            Duration::from_secs(2),
            move |msg| {
                let _ = tx.send(msg.clone());
            },
        )
        .await
        .unwrap();
    assert_eq!(&reply.payload[..], b"pong");

    // the callback must also have observed the (only, final) reply
    let observed = rx.try_recv().expect("callback should have fired for the final reply");
    assert_eq!(&observed.payload[..], b"pong");
    assert!(observed.is_end_sequence);
}

#[tokio::test]
async fn publish_with_reply_sync_delivers_every_partial_reply_to_the_callback() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let responder = node(broker_port, "responder-5").await.unwrap();
    responder
        .subscribe("req/sequence", Transport::Mqtt, QoS::AtLeastOnce, {
            let responder = responder.clone();
            move |msg| {
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Some(mut seq) = fleetmq::ReplySequence::from_message(&msg) {
                        responder.send_reply(&mut seq, "a", QoS::AtLeastOnce, false, false).await.unwrap();
                        responder.send_reply(&mut seq, "b", QoS::AtLeastOnce, false, false).await.unwrap();
                        responder.send_reply(&mut seq, "c", QoS::AtLeastOnce, false, true).await.unwrap();
                    }
                });
            }
        })
        .await
        .unwrap();
    time::sleep(Duration::from_millis(100)).await;

    let requester = node(broker_port, "requester-5").await.unwrap();
    let observed = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let reply = requester
        .publish_with_reply_sync(
            "req/sequence",
            "?",
            QoS::AtLeastOnce,
            false,
            Transport::Mqtt,
            "corr-5",
            Duration::from_millis(500),
            {
                let observed = observed.clone();
                move |msg| observed.lock().push((msg.sequence, msg.payload.clone(), msg.is_end_sequence))
            },
        )
        .await
        .unwrap();

    assert_eq!(&reply.payload[..], b"c");
    let observed = observed.lock();
    assert_eq!(observed.len(), 3);
    assert_eq!(observed[0], (1, bytes::Bytes::from_static(b"a"), false));
    assert_eq!(observed[1], (2, bytes::Bytes::from_static(b"b"), false));
    assert_eq!(observed[2], (3, bytes::Bytes::from_static(b"c"), true));
}

#[tokio::test]
async fn publish_with_reply_sync_times_out_without_a_responder() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let requester = node(broker_port, "requester-3").await.unwrap();
    let result = requester
        .publish_with_reply_sync(
            "req/nobody-home",
            "ping",
            QoS::AtLeastOnce,
            false,
            Transport::Mqtt,
            "corr-3",
            Duration::from_millis(300),
            |_msg| {},
        )
        .await;
    assert!(matches!(result, Err(Error::TimedOut)));
}

#[tokio::test]
async fn publish_with_reply_sync_rejects_tcp() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let node = node_with_tcp(broker_port, "requester-4", false).await.unwrap();
    let result = node
        .publish_with_reply_sync(
            "req/tcp",
            "ping",
            QoS::AtLeastOnce,
            false,
            Transport::Tcp,
            "corr-4",
            Duration::from_millis(300),
            |_msg| {},
        )
        .await;
    assert!(matches!(result, Err(Error::NotSupported)));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let subscriber = node(broker_port, "sub-2").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = subscriber
        .subscribe("quiet/#", Transport::Mqtt, QoS::AtLeastOnce, move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();

    subscriber.unsubscribe(handle).await.unwrap();

    let publisher = node(broker_port, "pub-2").await.unwrap();
    publisher.publish("quiet/topic", "x", QoS::AtLeastOnce, false).await.unwrap();

    let result = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(result.is_err(), "expected no delivery after unsubscribe, got {result:?}");

    let err = subscriber.unsubscribe(handle).await.unwrap_err();
    assert!(matches!(err, Error::NoData));
}

#[tokio::test]
async fn count_subscriber_sums_transports_selected_by_mask() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    // The subscribing node announces both its MQTT discovery patterns and
    // its TCP peer-table entry; a separate querying node picks up both
    // via discovery rather than relying on self-delivery of its own
    // retained announcements.
    let subscriber = node_with_tcp(broker_port, "counter-sub", false).await.unwrap();
    subscriber
        .subscribe("metrics/cpu", Transport::Mqtt, QoS::AtLeastOnce, |_| {})
        .await
        .unwrap();
    subscriber
        .subscribe("metrics/cpu", Transport::Tcp, QoS::AtLeastOnce, |_| {})
        .await
        .unwrap();
    time::sleep(Duration::from_millis(200)).await;

    let query = node_with_tcp(broker_port, "counter-query", false).await.unwrap();
    time::sleep(Duration::from_millis(300)).await;

    assert_eq!(query.count_subscriber("metrics/cpu", TRANSPORT_MQTT).await.unwrap(), 1);
    assert_eq!(query.count_subscriber("metrics/cpu", TRANSPORT_TCP).await.unwrap(), 1);
    assert_eq!(query.count_subscriber("metrics/cpu", TRANSPORT_ALL).await.unwrap(), 2);
    assert_eq!(query.count_subscriber("metrics/idle", TRANSPORT_ALL).await.unwrap(), 0);

    let err = query.count_subscriber("metrics/#", TRANSPORT_ALL).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported));
}

#[tokio::test]
async fn disconnect_tears_down_cleanly() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let node = node(broker_port, "lifecycle-1").await.unwrap();
    assert!(node.is_connected().await);
    node.disconnect().await.unwrap();
}

#[tokio::test]
async fn connect_disconnect_connect_cycle_is_legal_on_one_facade() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let node = node(broker_port, "lifecycle-2").await.unwrap();
    assert!(node.is_connected().await);

    node.disconnect().await.unwrap();
    assert!(!node.is_connected().await);

    node.connect().await.unwrap();
    assert!(node.is_connected().await);
    node.disconnect().await.unwrap();
}

#[tokio::test]
async fn connect_while_already_connected_is_rejected() {
    let broker_port = port();
    let _guard = broker(broker_port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let node = node(broker_port, "lifecycle-3").await.unwrap();
    let err = node.connect().await.unwrap_err();
    assert!(matches!(err, Error::Already));
    node.disconnect().await.unwrap();
}
