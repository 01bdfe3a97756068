use std::time::Duration;

use embroker::{
    Broker, BrokerError, BrokerOptions, CorrelationFilter, Message, ReceiveMode, RuleDescription,
    SendAck, SubscriptionOptions, TopicOptions,
};

fn broker() -> Broker {
    Broker::new(BrokerOptions::default())
}

async fn receive_body(broker: &Broker, topic: &str, subscription: &str) -> Option<Vec<u8>> {
    broker
        .receive(
            topic,
            Some(subscription),
            ReceiveMode::ReceiveAndDelete,
            Duration::from_millis(200),
        )
        .await
        .unwrap()
        .map(|received| received.message.body)
}

#[tokio::test]
async fn test_topic_fanout_to_all_subscriptions() {
    let broker = broker();
    broker.create_topic("orders", TopicOptions::default()).await.unwrap();
    broker
        .create_subscription("orders", "sub-a", SubscriptionOptions::default(), vec![])
        .await
        .unwrap();
    broker
        .create_subscription("orders", "sub-b", SubscriptionOptions::default(), vec![])
        .await
        .unwrap();

    let ack = broker.send("orders", Message::new("fanout")).await.unwrap();
    assert_eq!(ack, SendAck::Enqueued { copies: 2 });

    assert_eq!(receive_body(&broker, "orders", "sub-a").await.unwrap(), b"fanout");
    assert_eq!(receive_body(&broker, "orders", "sub-b").await.unwrap(), b"fanout");
}

// Correlation filter on content type: "application/text" is delivered,
// "application/json" is not.
#[tokio::test]
async fn test_correlation_filter_routes_by_content_type() {
    let broker = broker();
    broker.create_topic("t1", TopicOptions::default()).await.unwrap();
    broker
        .create_subscription(
            "t1",
            "s1",
            SubscriptionOptions::default(),
            vec![RuleDescription::correlation(
                "text-only",
                CorrelationFilter {
                    content_type: Some("application/text".to_string()),
                    ..Default::default()
                },
            )],
        )
        .await
        .unwrap();

    broker
        .send(
            "t1",
            Message::builder().body("text").content_type("application/text").build(),
        )
        .await
        .unwrap();
    broker
        .send(
            "t1",
            Message::builder().body("json").content_type("application/json").build(),
        )
        .await
        .unwrap();

    assert_eq!(receive_body(&broker, "t1", "s1").await.unwrap(), b"text");
    assert!(receive_body(&broker, "t1", "s1").await.is_none());
}

// A message matching subscriptions A and C (not B) lands as exactly two
// independent copies.
#[tokio::test]
async fn test_fanout_matches_a_and_c_not_b() {
    let broker = broker();
    broker.create_topic("t", TopicOptions::default()).await.unwrap();
    broker
        .create_subscription(
            "t",
            "a",
            SubscriptionOptions::default(),
            vec![RuleDescription::sql("by-region", "region = 'eu'")],
        )
        .await
        .unwrap();
    broker
        .create_subscription(
            "t",
            "b",
            SubscriptionOptions::default(),
            vec![RuleDescription::sql("by-kind", "kind = 'refund'")],
        )
        .await
        .unwrap();
    broker
        .create_subscription(
            "t",
            "c",
            SubscriptionOptions::default(),
            vec![RuleDescription::sql("by-priority", "priority = 1")],
        )
        .await
        .unwrap();

    let ack = broker
        .send(
            "t",
            Message::builder()
                .body("order")
                .property("region", "eu")
                .property("kind", "order")
                .property("priority", 1i64)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(ack, SendAck::Enqueued { copies: 2 });

    let a = broker
        .receive("t", Some("a"), ReceiveMode::PeekLock, Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    let c = broker
        .receive("t", Some("c"), ReceiveMode::PeekLock, Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    // Independent copies with their own sequence numbers per subscription.
    assert_eq!(a.sequence_number, 1);
    assert_eq!(c.sequence_number, 1);
    assert_eq!(a.message.body, c.message.body);

    assert!(receive_body(&broker, "t", "b").await.is_none());
}

#[tokio::test]
async fn test_rule_action_mutates_only_that_copy() {
    let broker = broker();
    broker.create_topic("t", TopicOptions::default()).await.unwrap();
    broker
        .create_subscription(
            "t",
            "tagged",
            SubscriptionOptions::default(),
            vec![RuleDescription::match_all("tag").with_action("SET sys.To = 'audit'")],
        )
        .await
        .unwrap();
    broker
        .create_subscription("t", "plain", SubscriptionOptions::default(), vec![])
        .await
        .unwrap();

    broker.send("t", Message::new("m")).await.unwrap();

    let tagged = broker
        .receive("t", Some("tagged"), ReceiveMode::ReceiveAndDelete, Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tagged.message.to.as_deref(), Some("audit"));

    let plain = broker
        .receive("t", Some("plain"), ReceiveMode::ReceiveAndDelete, Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    assert!(plain.message.to.is_none());
}

#[tokio::test]
async fn test_topic_duplicate_detection_suppresses_fanout() {
    let broker = broker();
    broker
        .create_topic(
            "t",
            TopicOptions {
                requires_duplicate_detection: true,
                duplicate_detection_history_window: Duration::from_secs(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    broker
        .create_subscription("t", "s", SubscriptionOptions::default(), vec![])
        .await
        .unwrap();

    let msg = || Message::builder().body("x").message_id("m-1").build();
    assert_eq!(broker.send("t", msg()).await.unwrap(), SendAck::Enqueued { copies: 1 });
    assert_eq!(broker.send("t", msg()).await.unwrap(), SendAck::Duplicate);

    assert!(receive_body(&broker, "t", "s").await.is_some());
    assert!(receive_body(&broker, "t", "s").await.is_none());
}

#[tokio::test]
async fn test_partial_fanout_reports_failed_subscriptions() {
    let broker = broker();
    broker.create_topic("t", TopicOptions::default()).await.unwrap();
    broker
        .create_subscription(
            "t",
            "tiny",
            SubscriptionOptions {
                max_size: 1,
                ..Default::default()
            },
            vec![],
        )
        .await
        .unwrap();
    broker
        .create_subscription("t", "roomy", SubscriptionOptions::default(), vec![])
        .await
        .unwrap();

    broker.send("t", Message::new("one")).await.unwrap();

    // "tiny" is at capacity now; the send reports the partial failure and
    // "roomy" keeps its copy.
    let err = broker.send("t", Message::new("two")).await.unwrap_err();
    match err {
        BrokerError::PartialFanout { delivered, failed } => {
            assert_eq!(delivered, vec!["roomy".to_string()]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].subscription, "tiny");
        }
        other => panic!("expected PartialFanout, got {other:?}"),
    }

    assert!(receive_body(&broker, "t", "roomy").await.is_some());
    assert!(receive_body(&broker, "t", "roomy").await.is_some());
}

#[tokio::test]
async fn test_receive_from_topic_without_subscription_fails() {
    let broker = broker();
    broker.create_topic("t", TopicOptions::default()).await.unwrap();

    let err = broker
        .receive("t", None, ReceiveMode::PeekLock, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_subscription_created_after_publish_sees_nothing() {
    let broker = broker();
    broker.create_topic("t", TopicOptions::default()).await.unwrap();
    broker.send("t", Message::new("before")).await.unwrap();

    broker
        .create_subscription("t", "late", SubscriptionOptions::default(), vec![])
        .await
        .unwrap();
    // Fan-out happens at publish time; a later subscription starts empty.
    assert!(receive_body(&broker, "t", "late").await.is_none());
}

#[tokio::test]
async fn test_subscription_dlq_is_per_subscription() {
    let broker = broker();
    broker.create_topic("t", TopicOptions::default()).await.unwrap();
    broker
        .create_subscription(
            "t",
            "s1",
            SubscriptionOptions {
                max_delivery_count: 1,
                ..Default::default()
            },
            vec![],
        )
        .await
        .unwrap();
    broker
        .create_subscription("t", "s2", SubscriptionOptions::default(), vec![])
        .await
        .unwrap();

    broker.send("t", Message::new("m")).await.unwrap();

    let received = broker
        .receive("t", Some("s1"), ReceiveMode::PeekLock, Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    broker.abandon(received.lock.as_ref().unwrap()).await.unwrap();

    let dead = broker
        .receive_dead_letter("t", Some("s1"), ReceiveMode::ReceiveAndDelete, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(dead.is_some());

    // s2's copy is untouched by s1's dead-lettering.
    assert!(receive_body(&broker, "t", "s2").await.is_some());
    let s2_dead = broker
        .receive_dead_letter("t", Some("s2"), ReceiveMode::PeekLock, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(s2_dead.is_none());
}
