//! Integration tests for Pub/Sub over RESP2 and RESP3

mod common;

use common::{Action, MockServer, Options};
use futures_util::StreamExt;
use redis_conduit::{
    Client, Commands, ProtocolVersion, PubSubKind, PubSubMessage, RespValue, Subscriber,
    SubscriptionState,
};
use std::time::Duration;

async fn resp3_client(server: &MockServer) -> Client {
    Client::connect(common::config(server).with_protocol(ProtocolVersion::Resp3))
        .await
        .unwrap()
}

async fn resp3_server() -> MockServer {
    MockServer::start(Options {
        resp3: true,
        ..Options::default()
    })
    .await
}

async fn next(subscriber: &mut Subscriber) -> PubSubMessage {
    tokio::time::timeout(Duration::from_secs(2), subscriber.next_message())
        .await
        .expect("no message within 2s")
        .expect("subscription stream ended")
}

#[tokio::test]
async fn test_resp2_subscribe_uses_dedicated_connection() {
    common::init_tracing();
    let server = MockServer::standalone().await;
    let client = Client::connect(common::config(&server)).await.unwrap();

    let mut subscriber = client.subscriber();
    subscriber.subscribe(["news"]).await.unwrap();
    assert_eq!(subscriber.state(), SubscriptionState::Subscribed);
    assert_eq!(server.connections(), 2);

    assert_eq!(client.publish("news", "hello").await.unwrap(), 1);
    let message = next(&mut subscriber).await;
    assert_eq!(message.kind, PubSubKind::Channel);
    assert_eq!(message.channel, "news");
    assert_eq!(message.payload_str(), "hello");
    assert_eq!(message.pattern, None);
}

#[tokio::test]
async fn test_resp3_subscribe_shares_connection() {
    let server = resp3_server().await;
    let client = resp3_client(&server).await;

    let mut subscriber = client.subscriber();
    subscriber.subscribe(["events"]).await.unwrap();
    assert_eq!(server.connections(), 1);

    // Ordinary commands keep working on the subscribed connection
    client.set("k", "v").await.unwrap();
    assert_eq!(client.get("k").await.unwrap().as_deref(), Some("v"));

    client.publish("events", "e1").await.unwrap();
    let message = subscriber.next().await.unwrap();
    assert_eq!(message.payload_str(), "e1");
}

#[tokio::test]
async fn test_pattern_subscription() {
    let server = resp3_server().await;
    let client = resp3_client(&server).await;

    let mut subscriber = client.subscriber();
    subscriber.psubscribe(["news.*"]).await.unwrap();
    assert_eq!(subscriber.subscriptions(PubSubKind::Pattern), vec!["news.*"]);

    client.publish("news.tech", "rust").await.unwrap();
    let message = next(&mut subscriber).await;
    assert_eq!(message.kind, PubSubKind::Pattern);
    assert_eq!(message.pattern.as_deref(), Some("news.*"));
    assert_eq!(message.channel, "news.tech");
    assert_eq!(message.payload_str(), "rust");
}

#[tokio::test]
async fn test_two_subscribers_share_one_server_subscription() {
    let server = resp3_server().await;
    let client = resp3_client(&server).await;

    let mut first = client.subscriber();
    let mut second = client.subscriber();
    first.subscribe(["shared"]).await.unwrap();
    second.subscribe(["shared"]).await.unwrap();
    assert_eq!(server.count("SUBSCRIBE"), 1);

    client.publish("shared", "both").await.unwrap();
    assert_eq!(next(&mut first).await.payload_str(), "both");
    assert_eq!(next(&mut second).await.payload_str(), "both");

    // The server subscription stays while one subscriber still listens
    first.unsubscribe(["shared"]).await.unwrap();
    assert_eq!(server.count("UNSUBSCRIBE"), 0);
    client.publish("shared", "second-only").await.unwrap();
    assert_eq!(next(&mut second).await.payload_str(), "second-only");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = resp3_server().await;
    let client = resp3_client(&server).await;

    let mut subscriber = client.subscriber();
    subscriber.subscribe(["a", "b"]).await.unwrap();
    subscriber.unsubscribe(["a", "b"]).await.unwrap();

    assert_eq!(subscriber.state(), SubscriptionState::Unsubscribed);
    assert!(subscriber.subscriptions(PubSubKind::Channel).is_empty());
    assert_eq!(client.publish("a", "lost").await.unwrap(), 0);
}

#[tokio::test]
async fn test_drop_unsubscribes() {
    let server = resp3_server().await;
    let client = resp3_client(&server).await;

    let mut subscriber = client.subscriber();
    subscriber.subscribe(["temporary"]).await.unwrap();
    drop(subscriber);

    server.wait_for(|s| s.count("UNSUBSCRIBE") == 1).await;
    assert_eq!(client.publish("temporary", "x").await.unwrap(), 0);
}

#[tokio::test]
async fn test_subscriptions_replayed_after_reconnect() {
    let server = resp3_server().await;
    let client = resp3_client(&server).await;

    let mut subscriber = client.subscriber();
    subscriber.subscribe(["durable"]).await.unwrap();
    subscriber.psubscribe(["dur*"]).await.unwrap();

    server.kill_connections();
    server
        .wait_for(|s| s.count("SUBSCRIBE") == 2 && s.count("PSUBSCRIBE") == 2)
        .await;

    assert_eq!(client.publish("durable", "back").await.unwrap(), 2);
    let mut kinds = vec![
        next(&mut subscriber).await.kind,
        next(&mut subscriber).await.kind,
    ];
    kinds.sort();
    assert_eq!(kinds, vec![PubSubKind::Channel, PubSubKind::Pattern]);
}

#[tokio::test]
async fn test_shard_subscription() {
    let server = resp3_server().await;
    let client = resp3_client(&server).await;

    let mut subscriber = client.subscriber();
    subscriber.ssubscribe(["orders"]).await.unwrap();
    assert_eq!(subscriber.subscriptions(PubSubKind::Shard), vec!["orders"]);

    client.spublish("orders", "o-1").await.unwrap();
    let message = next(&mut subscriber).await;
    assert_eq!(message.kind, PubSubKind::Shard);
    assert_eq!(message.channel, "orders");
}

#[tokio::test]
async fn test_refused_subscribe_keeps_earlier_channels() {
    let server = MockServer::start(Options {
        resp3: true,
        hook: common::hook(|_, args| {
            (args[0] == "SUBSCRIBE" && args[1..].iter().any(|name| name == "locked")).then(|| {
                Action::Reply(RespValue::Error(
                    "NOPERM this user has no permissions to access the 'locked' channel".into(),
                ))
            })
        }),
        ..Options::default()
    })
    .await;
    let client = resp3_client(&server).await;

    let mut subscriber = client.subscriber();
    subscriber.subscribe(["open"]).await.unwrap();
    assert!(subscriber.subscribe(["open", "locked"]).await.is_err());
    assert_eq!(subscriber.subscriptions(PubSubKind::Channel), vec!["open"]);
    assert_eq!(subscriber.state(), SubscriptionState::Subscribed);

    client.publish("open", "still here").await.unwrap();
    let message = next(&mut subscriber).await;
    assert_eq!(message.channel, "open");
    assert_eq!(message.payload_str(), "still here");
}
