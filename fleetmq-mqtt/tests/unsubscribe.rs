use std::time::Duration;

use common::{broker, client, port, subscribe_collecting};
use rumqttc::v5::mqttbytes::QoS;
use tokio::time::{self, timeout};

mod common;

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let port = port();
    let _guard = broker(port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let subscriber = client(port, "subscriber").await.unwrap();
    let (handle, mut rx) = subscribe_collecting(&subscriber, "unsubscribe_topic", QoS::AtLeastOnce)
        .await
        .unwrap();

    subscriber.unsubscribe(handle).await.unwrap();

    let publisher = client(port, "publisher").await.unwrap();
    publisher
        .publish(
            "unsubscribe_topic",
            QoS::AtLeastOnce,
            false,
            "message after unsubscribe",
        )
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
}

#[tokio::test]
async fn unsubscribe_one_of_two_leaves_the_other_delivering() {
    let port = port();
    let _guard = broker(port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let subscriber = client(port, "subscriber").await.unwrap();
    let (handle_a, mut rx_a) = subscribe_collecting(&subscriber, "topic", QoS::AtLeastOnce)
        .await
        .unwrap();
    let (_handle_b, mut rx_b) = subscribe_collecting(&subscriber, "topic", QoS::AtLeastOnce)
        .await
        .unwrap();

    subscriber.unsubscribe(handle_a).await.unwrap();

    let publisher = client(port, "publisher").await.unwrap();
    publisher
        .publish("topic", QoS::AtLeastOnce, false, "still here")
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(300), rx_a.recv()).await.is_err());
    let msg = timeout(Duration::from_secs(1), rx_b.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert_eq!(msg.payload, "still here");
}

#[tokio::test]
async fn unsubscribe_and_resubscribe() {
    let port = port();
    let _guard = broker(port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let subscriber = client(port, "subscriber").await.unwrap();
    let (handle, mut rx) = subscribe_collecting(&subscriber, "topic_to_unsubscribe", QoS::AtLeastOnce)
        .await
        .unwrap();
    subscriber.unsubscribe(handle).await.unwrap();

    let publisher = client(port, "publisher").await.unwrap();
    publisher
        .publish(
            "topic_to_unsubscribe",
            QoS::AtLeastOnce,
            false,
            "message after unsubscribe",
        )
        .await
        .unwrap();

    let (_handle2, mut rx2) =
        subscribe_collecting(&subscriber, "topic_to_unsubscribe", QoS::AtLeastOnce)
            .await
            .unwrap();
    publisher
        .publish(
            "topic_to_unsubscribe",
            QoS::AtLeastOnce,
            false,
            "message after resubscribe",
        )
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(1), rx2.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert_eq!(msg.payload, "message after resubscribe");
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn unknown_handle_is_no_data() {
    let port = port();
    let _guard = broker(port).drop_guard();
    time::sleep(Duration::from_millis(100)).await;

    let subscriber = client(port, "subscriber").await.unwrap();
    let (handle, _rx) = subscribe_collecting(&subscriber, "topic", QoS::AtLeastOnce)
        .await
        .unwrap();
    subscriber.unsubscribe(handle).await.unwrap();

    let err = subscriber.unsubscribe(handle).await.unwrap_err();
    assert!(matches!(err, fleetmq_mqtt::Error::NoData));
}
