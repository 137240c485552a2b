//! Broker client tests against an in-process broker
//!
//! Covers the reconnect state machine: after the broker drops the
//! connection, the client reconnects on its own and replays every
//! subscription exactly once.

mod common;

use std::time::Duration;

use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

use common::{FakeBroker, WAIT};
use knx2mqtt::mqtt::{BrokerClient, MqttError, MqttOptions, Subscription};

fn options(broker: &FakeBroker) -> MqttOptions {
    let mut options = MqttOptions::new(broker.addr.to_string(), "knx2mqtt-test");
    options.reconnect_interval = Duration::from_millis(50);
    options.operation_timeout = Duration::from_millis(500);
    options
}

async fn expect_message(subscription: &mut Subscription, topic: &str, payload: &[u8]) {
    let message = timeout(WAIT, subscription.recv())
        .await
        .expect("no message")
        .expect("subscription closed");
    assert_eq!(message.topic, topic);
    assert_eq!(&message.payload[..], payload);
}

#[tokio::test]
async fn test_subscriptions_survive_reconnect() {
    let broker = FakeBroker::start().await;
    let client = BrokerClient::connect(options(&broker)).await;
    broker.wait_connections(1).await;

    let filters = ["knx/cmd", "rooms/cmd", "status/+/state"];
    let mut subscriptions = Vec::new();
    for filter in filters {
        subscriptions.push(assert_ok!(client.subscribe(filter).await));
    }

    broker.publish("knx/cmd", "a");
    broker.publish("rooms/cmd", "b");
    broker.publish("status/hall/state", "c");
    expect_message(&mut subscriptions[0], "knx/cmd", b"a").await;
    expect_message(&mut subscriptions[1], "rooms/cmd", b"b").await;
    expect_message(&mut subscriptions[2], "status/hall/state", b"c").await;

    broker.drop_connections();
    broker.wait_connections(2).await;
    for filter in filters {
        broker.wait_subscribed(filter, 2).await;
    }

    // Give a duplicate replay the chance to show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    for filter in filters {
        assert_eq!(broker.subscribe_count(filter), 2, "{}", filter);
    }

    broker.publish("knx/cmd", "d");
    broker.publish("rooms/cmd", "e");
    broker.publish("status/cellar/state", "f");
    expect_message(&mut subscriptions[0], "knx/cmd", b"d").await;
    expect_message(&mut subscriptions[1], "rooms/cmd", b"e").await;
    expect_message(&mut subscriptions[2], "status/cellar/state", b"f").await;
}

#[tokio::test]
async fn test_unanswered_resubscribe_forces_reconnect() {
    let broker = FakeBroker::start().await;
    let client = BrokerClient::connect(options(&broker)).await;
    broker.wait_connections(1).await;

    let mut subscription = assert_ok!(client.subscribe("knx/cmd").await);

    // The replay on the second connection never gets a SUBACK
    broker.swallow_subscribes(1);
    broker.drop_connections();
    broker.wait_connections(3).await;
    broker.wait_subscribed("knx/cmd", 2).await;

    broker.publish("knx/cmd", "after");
    expect_message(&mut subscription, "knx/cmd", b"after").await;
}

#[tokio::test]
async fn test_timed_out_subscribe_is_forgotten() {
    let broker = FakeBroker::start().await;
    let client = BrokerClient::connect(options(&broker)).await;
    broker.wait_connections(1).await;

    broker.swallow_subscribes(1);
    let err = assert_err!(client.subscribe("rooms/cmd").await);
    assert!(matches!(err, MqttError::Timeout), "{}", err);
    let _kept = assert_ok!(client.subscribe("knx/cmd").await);

    broker.drop_connections();
    broker.wait_connections(2).await;
    broker.wait_subscribed("knx/cmd", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.subscribe_count("rooms/cmd"), 0);
}

#[tokio::test]
async fn test_publish_reaches_broker() {
    let broker = FakeBroker::start().await;
    let client = BrokerClient::connect(options(&broker)).await;

    assert_ok!(client.publish("knx/1/2/3", "{}").await);
    let publish = broker.next_publish().await;
    assert_eq!(publish.topic, "knx/1/2/3");
    assert!(!publish.retain);

    assert_ok!(client.publish_retain("rooms/temp", "20240301-120005 21.50 °C").await);
    let publish = broker.next_publish().await;
    assert_eq!(publish.topic, "rooms/temp");
    assert!(publish.retain);
    assert_eq!(&publish.payload[..], "20240301-120005 21.50 °C".as_bytes());
}

#[tokio::test]
async fn test_publish_fails_while_disconnected_then_recovers() {
    let broker = FakeBroker::start().await;
    let client = BrokerClient::connect(options(&broker)).await;
    broker.wait_connections(1).await;

    broker.refuse(true);
    broker.drop_connections();

    // The supervisor holds the client state while it retries, so
    // operations issued now run into their timeout
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = assert_err!(client.publish("knx/1/1/1", "x").await);
    assert!(
        matches!(err, MqttError::Timeout | MqttError::ConnectionLost(_)),
        "{}",
        err
    );

    broker.refuse(false);
    broker.wait_connections(2).await;
    timeout(WAIT, async {
        while client.publish("knx/1/1/1", "y").await.is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("publish never recovered");
    assert_eq!(broker.next_publish_on("knx/1/1/1").await.payload, "y".as_bytes());
}

#[tokio::test]
async fn test_connect_retries_until_broker_answers() {
    let broker = FakeBroker::start().await;
    broker.refuse(true);

    let opts = options(&broker);
    let connecting = tokio::spawn(BrokerClient::connect(opts));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!connecting.is_finished());

    broker.refuse(false);
    let client = timeout(WAIT, connecting)
        .await
        .expect("client never connected")
        .unwrap();
    assert!(client.is_connected().await);
}
