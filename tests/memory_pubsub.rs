// tests/memory_pubsub.rs

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::timeout;

use mom_pubsub::{
    // ---
    Context,
    ErrorCode,
    MemoryBroker,
    MemoryError,
    Message,
    NativeError,
    NativeRef,
    Subscription,
    SubscriptionOptions,
    TopicDriver,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn outstanding(sub: &Subscription) -> usize {
    match sub.as_native() {
        Some(NativeRef::MemorySubscription(driver)) => driver.outstanding(),
        other => panic!("unexpected native handle: {other:?}"),
    }
}

/// Poll until `cond` holds; acks are flushed in the background.
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn send_receive_ack() {
    // ---
    // Arrange
    // ---
    init_tracing();
    let broker = MemoryBroker::new();
    let topic = broker.create_topic("orders").expect("create topic failed");
    let sub = broker
        .open_subscription("orders", Duration::from_secs(30))
        .expect("open subscription failed");
    let ctx = Context::background();

    // ---
    // Act
    // ---
    topic
        .send(&ctx, Message::new("hello").with_metadata("kind", "greeting"))
        .await
        .expect("send failed");

    let msg = timeout(Duration::from_secs(1), sub.receive(&ctx))
        .await
        .expect("timed out waiting for message")
        .expect("receive failed");
    msg.ack();

    // ---
    // Assert
    // ---
    assert_eq!(msg.body, "hello");
    assert_eq!(msg.metadata.get("kind").map(String::as_str), Some("greeting"));
    assert_eq!(msg.loggable_id(), Some("orders/0"));
    eventually(|| outstanding(&sub) == 0).await;

    topic.shutdown(&ctx).await.expect("topic shutdown failed");
    sub.shutdown(&ctx).await.expect("subscription shutdown failed");
}

#[tokio::test]
async fn ack_from_thread_outside_runtime() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let topic = broker.create_topic("jobs").expect("create topic failed");
    let sub = broker
        .open_subscription("jobs", Duration::from_secs(30))
        .expect("open subscription failed");
    let ctx = Context::background();

    topic.send(&ctx, Message::new("work")).await.expect("send failed");
    let msg = sub.receive(&ctx).await.expect("receive failed");

    // ---
    // Act
    // ---
    std::thread::spawn(move || msg.ack())
        .join()
        .expect("ack panicked on a plain thread");

    // ---
    // Assert
    // ---
    eventually(|| outstanding(&sub) == 0).await;
    sub.shutdown(&ctx).await.expect("subscription shutdown failed");
}

#[tokio::test]
async fn every_subscription_gets_every_message() {
    // ---
    let broker = MemoryBroker::new();
    let topic = broker.create_topic("fanout").expect("create topic failed");
    let first = broker
        .open_subscription("fanout", Duration::from_secs(30))
        .expect("open subscription failed");
    let second = broker
        .open_subscription("fanout", Duration::from_secs(30))
        .expect("open subscription failed");
    let ctx = Context::background();

    topic.send(&ctx, Message::new("x")).await.expect("send failed");

    for sub in [&first, &second] {
        let msg = sub.receive(&ctx).await.expect("receive failed");
        assert_eq!(msg.body, "x");
        msg.ack();
    }
}

#[tokio::test(start_paused = true)]
async fn unacked_message_is_redelivered_with_new_ack_id() {
    // ---
    let broker = MemoryBroker::new();
    let topic = broker.create_topic("t").expect("create topic failed");
    let sub = broker
        .open_subscription("t", Duration::from_millis(100))
        .expect("open subscription failed");
    let ctx = Context::background();

    topic.send(&ctx, Message::new("again")).await.expect("send failed");

    let first = sub.receive(&ctx).await.expect("receive failed");
    let second = sub.receive(&ctx).await.expect("redelivery failed");

    assert_eq!(first.body, second.body);
    assert_ne!(first.ack_id(), second.ack_id());
}

#[tokio::test]
async fn nacked_message_is_redelivered_promptly() {
    // ---
    let broker = MemoryBroker::new();
    let topic = broker.create_topic("t").expect("create topic failed");
    let sub = broker
        .open_subscription("t", Duration::from_secs(3600))
        .expect("open subscription failed");
    let ctx = Context::background();

    topic.send(&ctx, Message::new("retry me")).await.expect("send failed");

    let msg = sub.receive(&ctx).await.expect("receive failed");
    msg.nack().expect("nack failed");

    let again = timeout(Duration::from_secs(1), sub.receive(&ctx))
        .await
        .expect("nacked message was not redelivered")
        .expect("receive failed");
    assert_eq!(again.body, "retry me");
}

#[tokio::test(start_paused = true)]
async fn every_message_is_delivered_until_acked() {
    // ---
    // Arrange
    // ---
    init_tracing();
    const N: usize = 20;

    let broker = MemoryBroker::new();
    let topic = broker.create_topic("t").expect("create topic failed");
    let sub = broker
        .open_subscription_with(
            "t",
            Duration::from_millis(200),
            SubscriptionOptions::default().with_receive_batch_size(3),
        )
        .expect("open subscription failed");
    let ctx = Context::background();

    for i in 0..N {
        topic
            .send(&ctx, Message::new(format!("{i}")))
            .await
            .expect("send failed");
    }

    // ---
    // Act
    // ---
    // Odd messages are left unacked on first delivery and must come back.
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut acked: HashSet<String> = HashSet::new();

    while acked.len() < N {
        let recv_ctx = ctx.with_timeout(Duration::from_secs(5));
        let msg = sub.receive(&recv_ctx).await.expect("receive failed");
        let body = String::from_utf8(msg.body.to_vec()).expect("utf8 body");

        assert!(!acked.contains(&body), "{body} delivered after ack");

        let count = seen.entry(body.clone()).or_default();
        *count += 1;
        let index: usize = body.parse().expect("numeric body");
        if index % 2 == 0 || *count > 1 {
            msg.ack();
            acked.insert(body);
        }
    }

    // ---
    // Assert
    // ---
    eventually(|| outstanding(&sub) == 0).await;

    let idle = ctx.with_timeout(Duration::from_secs(1));
    let err = sub.receive(&idle).await.expect_err("message delivered after ack");
    assert_eq!(err.code(), ErrorCode::DeadlineExceeded);

    for (body, count) in seen {
        let index: usize = body.parse().expect("numeric body");
        let want = if index % 2 == 0 { 1 } else { 2 };
        assert_eq!(count, want, "message {body}");
    }
}

#[tokio::test]
async fn driver_errors_expose_native_error() {
    // ---
    let broker = MemoryBroker::new();
    let topic = broker.create_topic("t").expect("create topic failed");
    let ctx = Context::background();

    let driver = broker.topic_driver("t").expect("topic not registered");
    driver.close().await.expect("close failed");

    let err = topic
        .send(&ctx, Message::new("x"))
        .await
        .expect_err("send to closed driver succeeded");

    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    match topic.error_as(&err) {
        Some(NativeError::Memory(MemoryError::TopicClosed(name))) => assert_eq!(name, "t"),
        other => panic!("unexpected native error: {other:?}"),
    }

    match topic.as_native() {
        Some(NativeRef::MemoryTopic(native)) => assert!(native.is_closed()),
        other => panic!("unexpected native handle: {other:?}"),
    }
}

#[tokio::test]
async fn brokers_are_isolated() {
    // ---
    let a = MemoryBroker::new();
    let b = MemoryBroker::new();
    a.create_topic("shared").expect("create topic failed");

    let err = b
        .open_subscription("shared", Duration::from_secs(1))
        .expect_err("topic leaked between brokers");
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(a.topic_driver("shared").is_some());
}
