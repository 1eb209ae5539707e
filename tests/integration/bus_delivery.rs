//! Message bus delivery tests.
//!
//! These tests exercise the bus under concurrent load: per-publisher order,
//! isolation between topics, faulty handlers and backpressure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use forge::bus::{
    handler_fn, BackpressurePolicy, BusConfig, ChannelHandler, Message, MessageBus, Payload,
};
use forge::Error;

use crate::fixtures::WAIT;

fn content(message: &Message) -> String {
    match &message.payload {
        Payload::Text { content } => content.clone(),
        other => panic!("unexpected payload {}", other.name()),
    }
}

async fn collect(rx: &mut mpsc::Receiver<Message>, count: usize) -> Vec<Message> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let next = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for messages")
            .expect("channel closed");
        out.push(next);
    }
    out
}

/// Test: Per-publisher order under concurrency
/// Given four publishers sending 50 messages each to one topic
/// When they publish concurrently
/// Then every message arrives once and each publisher's messages keep their order
#[tokio::test]
async fn test_concurrent_publishers_keep_their_order() {
    let bus = MessageBus::default();
    let (tx, mut rx) = mpsc::channel(512);
    bus.subscribe("builds", "observer", Arc::new(ChannelHandler::new(tx)))
        .unwrap();

    let mut publishers = Vec::new();
    for p in 0..4 {
        let bus = bus.clone();
        publishers.push(tokio::spawn(async move {
            for n in 0..50 {
                let sender = format!("pub-{}", p);
                bus.publish("builds", Message::text(&sender, "builds", &n.to_string()))
                    .await
                    .unwrap();
            }
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let received = collect(&mut rx, 200).await;
    let mut per_sender: HashMap<String, Vec<u32>> = HashMap::new();
    for message in &received {
        per_sender
            .entry(message.sender.clone())
            .or_default()
            .push(content(message).parse().unwrap());
    }
    assert_eq!(per_sender.len(), 4);
    for (sender, seq) in per_sender {
        assert_eq!(seq, (0..50).collect::<Vec<u32>>(), "order broken for {}", sender);
    }
    bus.shutdown();
}

/// Test: A stuck topic does not stall others
/// Given a subscriber that never returns on one topic
/// When messages are published on that topic and another
/// Then the other topic's subscriber still receives its messages
#[tokio::test]
async fn test_stuck_subscriber_isolated_to_its_topic() {
    let bus = MessageBus::default();
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    bus.subscribe(
        "slow",
        "stuck",
        handler_fn(move |_| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        }),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    bus.subscribe("fast", "observer", Arc::new(ChannelHandler::new(tx)))
        .unwrap();

    for n in 0..3 {
        bus.publish("slow", Message::text("test", "slow", &n.to_string()))
            .await
            .unwrap();
    }
    for n in 0..3 {
        bus.publish("fast", Message::text("test", "fast", &n.to_string()))
            .await
            .unwrap();
    }

    let received: Vec<String> = collect(&mut rx, 3).await.iter().map(content).collect();
    assert_eq!(received, vec!["0", "1", "2"]);
    release.notify_waiters();
    bus.shutdown();
}

/// Test: Faulty handlers are skipped
/// Given a subscriber that errors and one that panics ahead of a healthy one
/// When messages are published
/// Then the healthy subscriber gets every message and failures are counted
#[tokio::test]
async fn test_faulty_handlers_do_not_stop_delivery() {
    let bus = MessageBus::default();
    bus.subscribe(
        "events",
        "erroring",
        handler_fn(|_| async { Err(Error::Validation("rejected".to_string())) }),
    )
    .unwrap();
    bus.subscribe(
        "events",
        "panicking",
        handler_fn(|message| async move {
            if content(&message) == "1" {
                panic!("handler exploded");
            }
            Ok(())
        }),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    bus.subscribe("events", "healthy", Arc::new(ChannelHandler::new(tx)))
        .unwrap();

    for n in 0..3 {
        assert_eq!(
            bus.publish("events", Message::text("test", "events", &n.to_string()))
                .await
                .unwrap(),
            3
        );
    }

    let received: Vec<String> = collect(&mut rx, 3).await.iter().map(content).collect();
    assert_eq!(received, vec!["0", "1", "2"]);
    // Three errors plus one panic.
    assert_eq!(bus.delivery_failures(), 4);
    bus.shutdown();
}

/// Test: Reject policy surfaces backpressure
/// Given a topic with capacity 2 whose only subscriber is stuck
/// When more messages are published than the queue holds
/// Then publish fails with TopicFull instead of waiting
#[tokio::test]
async fn test_reject_policy_reports_full_topic() {
    let bus = MessageBus::new(BusConfig {
        topic_capacity: 2,
        backpressure: BackpressurePolicy::Reject,
        ..BusConfig::default()
    });
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    bus.subscribe(
        "jammed",
        "stuck",
        handler_fn(move |_| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        }),
    )
    .unwrap();

    let mut outcome = Ok(0);
    for n in 0..10 {
        outcome = bus
            .publish("jammed", Message::text("test", "jammed", &n.to_string()))
            .await;
        if outcome.is_err() {
            break;
        }
        // Let the dispatcher pick up the first message and block on it.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(matches!(outcome, Err(Error::TopicFull { ref topic }) if topic == "jammed"));
    release.notify_waiters();
    bus.shutdown();
}

/// Test: Publishing after shutdown
/// Given a bus that has been shut down
/// When a message is published or sent direct
/// Then both fail with BusClosed
#[tokio::test]
async fn test_closed_bus_rejects_traffic() {
    let bus = MessageBus::default();
    let agent = forge::agent::AgentId::new("be-1");
    let _inbox = bus.register_inbox(&agent);
    bus.shutdown();

    assert!(matches!(
        bus.publish("any", Message::text("test", "any", "hi")).await,
        Err(Error::BusClosed)
    ));
    assert!(matches!(
        bus.send_direct(&agent, Message::text("test", "any", "hi")).await,
        Err(Error::BusClosed)
    ));
}
