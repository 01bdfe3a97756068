use std::time::Duration;

use embroker::{
    Broker, BrokerError, BrokerOptions, Message, QueueOptions, ReceiveMode, SendAck, Settlement,
};

fn broker() -> Broker {
    Broker::new(BrokerOptions::default())
}

#[tokio::test]
async fn test_queue_send_receive_complete() {
    let broker = broker();
    broker
        .create_queue("input-queue", QueueOptions::default())
        .await
        .unwrap();

    let ack = broker
        .send("input-queue", Message::new("hello world"))
        .await
        .unwrap();
    assert_eq!(ack, SendAck::Enqueued { copies: 1 });

    let received = broker
        .receive("input-queue", None, ReceiveMode::PeekLock, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("message should be available");
    assert_eq!(received.message.body, b"hello world");
    assert_eq!(received.delivery_count, 1);

    let lock = received.lock.as_ref().expect("peek-lock returns a handle");
    broker.complete(lock).await.unwrap();

    // Completed messages are gone for good.
    let again = broker
        .receive("input-queue", None, ReceiveMode::PeekLock, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_receive_empty_queue_times_out_with_none() {
    let broker = broker();
    broker
        .create_queue("empty", QueueOptions::default())
        .await
        .unwrap();

    let outcome = broker
        .receive("empty", None, ReceiveMode::PeekLock, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn test_send_to_missing_entity_fails() {
    let broker = broker();
    let err = broker.send("ghost", Message::new("x")).await.unwrap_err();
    assert_eq!(err, BrokerError::EntityNotFound("ghost".to_string()));
}

// Create a queue with a 1h TTL, send 3 messages, peek-lock one with a 1s
// lock, let the lock expire, receive again: same content, delivery count 2.
#[tokio::test]
async fn test_lock_expiry_redelivers_same_message() {
    let broker = broker();
    broker
        .create_queue(
            "q1",
            QueueOptions {
                default_message_ttl: Some(Duration::from_secs(3600)),
                lock_duration: Duration::from_secs(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for body in ["first", "second", "third"] {
        broker.send("q1", Message::new(body)).await.unwrap();
    }

    let first = broker
        .receive("q1", None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.message.body, b"first");
    assert_eq!(first.delivery_count, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let second = broker
        .receive("q1", None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.message.body, b"first");
    assert_eq!(second.delivery_count, 2);
}

#[tokio::test]
async fn test_duplicate_detection_stores_one_message() {
    let broker = broker();
    broker
        .create_queue(
            "work-queue",
            QueueOptions {
                requires_duplicate_detection: true,
                duplicate_detection_history_window: Duration::from_secs(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let first = broker
        .send(
            "work-queue",
            Message::builder().body("payload").message_id("m-1").build(),
        )
        .await
        .unwrap();
    assert_eq!(first, SendAck::Enqueued { copies: 1 });

    // Same id inside the window: idempotent success, nothing stored.
    let second = broker
        .send(
            "work-queue",
            Message::builder().body("payload again").message_id("m-1").build(),
        )
        .await
        .unwrap();
    assert_eq!(second, SendAck::Duplicate);

    let received = broker
        .receive("work-queue", None, ReceiveMode::ReceiveAndDelete, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message.body, b"payload");
    let empty = broker
        .receive("work-queue", None, ReceiveMode::ReceiveAndDelete, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(empty.is_none());
}

#[tokio::test]
async fn test_duplicate_detection_window_expires() {
    let broker = broker();
    broker
        .create_queue(
            "q",
            QueueOptions {
                requires_duplicate_detection: true,
                duplicate_detection_history_window: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let msg = || Message::builder().body("x").message_id("m-1").build();
    assert_eq!(broker.send("q", msg()).await.unwrap(), SendAck::Enqueued { copies: 1 });
    tokio::time::sleep(Duration::from_millis(80)).await;
    // Outside the window the same id stores a second message.
    assert_eq!(broker.send("q", msg()).await.unwrap(), SendAck::Enqueued { copies: 1 });
}

#[tokio::test]
async fn test_messages_without_id_bypass_duplicate_detection() {
    let broker = broker();
    broker
        .create_queue(
            "q",
            QueueOptions {
                requires_duplicate_detection: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // No message id: nothing to key detection on, both are stored.
    broker.send("q", Message::new("one")).await.unwrap();
    broker.send("q", Message::new("two")).await.unwrap();

    for expected in [b"one".as_slice(), b"two".as_slice()] {
        let received = broker
            .receive("q", None, ReceiveMode::ReceiveAndDelete, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message.body, expected);
    }
}

#[tokio::test]
async fn test_abandoned_past_max_delivery_goes_to_dlq() {
    let broker = broker();
    broker
        .create_queue(
            "q",
            QueueOptions {
                max_delivery_count: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    broker.send("q", Message::new("poison")).await.unwrap();

    for attempt in 1..=3u32 {
        let received = broker
            .receive("q", None, ReceiveMode::PeekLock, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.delivery_count, attempt);
        let settlement = broker.abandon(received.lock.as_ref().unwrap()).await.unwrap();
        if attempt < 3 {
            assert_eq!(settlement, Settlement::Abandoned);
        } else {
            assert_eq!(settlement, Settlement::DeadLettered);
        }
    }

    // Absent from the main available set.
    let empty = broker
        .receive("q", None, ReceiveMode::PeekLock, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(empty.is_none());

    // Present in the dead-letter sub-queue, with the reason stamped.
    let dead = broker
        .receive_dead_letter("q", None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.message.body, b"poison");
    assert_eq!(
        dead.dead_letter_reason.as_deref(),
        Some("MaxDeliveryCountExceeded")
    );
    broker.complete(dead.lock.as_ref().unwrap()).await.unwrap();
}

#[tokio::test]
async fn test_explicit_dead_letter_with_reason() {
    let broker = broker();
    broker.create_queue("q", QueueOptions::default()).await.unwrap();
    broker.send("q", Message::new("bad")).await.unwrap();

    let received = broker
        .receive("q", None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker
        .dead_letter(
            received.lock.as_ref().unwrap(),
            Some("MalformedPayload".to_string()),
            Some("missing header".to_string()),
        )
        .await
        .unwrap();

    let dead = broker
        .receive_dead_letter("q", None, ReceiveMode::ReceiveAndDelete, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.dead_letter_reason.as_deref(), Some("MalformedPayload"));
    assert_eq!(dead.dead_letter_description.as_deref(), Some("missing header"));

    // Dead-lettering from the DLQ itself is refused.
    broker.send("q", Message::new("x")).await.unwrap();
    let received = broker
        .receive("q", None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker
        .dead_letter(received.lock.as_ref().unwrap(), None, None)
        .await
        .unwrap();
    let dead = broker
        .receive_dead_letter("q", None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let err = broker
        .dead_letter(dead.lock.as_ref().unwrap(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnsupportedConfiguration(_)));
}

#[tokio::test]
async fn test_maintenance_sweep_frees_expired_locks() {
    let broker = broker();
    broker
        .create_queue(
            "q",
            QueueOptions {
                lock_duration: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    broker.start_maintenance(Duration::from_millis(20));

    broker.send("q", Message::new("hello")).await.unwrap();
    let first = broker
        .receive("q", None, ReceiveMode::PeekLock, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    // No explicit settlement and no further receive calls: the sweep alone
    // must make the message available again.
    let second = broker
        .receive("q", None, ReceiveMode::PeekLock, Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.sequence_number, first.sequence_number);
    assert_eq!(second.delivery_count, 2);
    broker.stop_maintenance();
}

#[tokio::test]
async fn test_competing_consumers_each_get_distinct_messages() {
    let broker = std::sync::Arc::new(broker());
    broker.create_queue("q", QueueOptions::default()).await.unwrap();
    for i in 0..4 {
        broker
            .send("q", Message::builder().body(format!("m-{i}")).build())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let received = broker
                .receive("q", None, ReceiveMode::PeekLock, Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            let seq = received.sequence_number;
            broker.complete(received.lock.as_ref().unwrap()).await.unwrap();
            seq
        }));
    }

    let mut sequences = Vec::new();
    for handle in handles {
        sequences.push(handle.await.unwrap());
    }
    sequences.sort_unstable();
    sequences.dedup();
    // Four consumers, four distinct messages.
    assert_eq!(sequences.len(), 4);
}
