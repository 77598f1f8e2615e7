// src/driver/memory/broker.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{MemoryError, MemorySubscription, MemoryTopic};
use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    Error,
    Result,
    Subscription,
    SubscriptionBuilder,
    SubscriptionOptions,
    Topic,
    TopicBuilder,
    TopicOptions,
};

/// Registry of named in-memory topics.
///
/// Simulates a message broker within a single process: topics are created
/// by name and subscriptions are opened against those names. Each broker is
/// an independent namespace, so parallel tests stay isolated by constructing
/// their own broker.
///
/// # Example
///
/// ```
/// use mom_pubsub::{Context, MemoryBroker, Message};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_pubsub::Result<()> {
/// let broker = MemoryBroker::new();
/// let topic = broker.create_topic("orders")?;
/// let sub = broker.open_subscription("orders", Duration::from_secs(10))?;
///
/// let ctx = Context::background();
/// topic.send(&ctx, Message::new("hello")).await?;
///
/// let msg = sub.receive(&ctx).await?;
/// assert_eq!(msg.body, "hello");
/// msg.ack();
///
/// topic.shutdown(&ctx).await?;
/// sub.shutdown(&ctx).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryBroker {
    // ---
    topics: Mutex<HashMap<String, MemoryTopic>>,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a topic with default options.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if a topic with this name exists and was not closed.
    pub fn create_topic(&self, name: &str) -> Result<Topic> {
        self.create_topic_with(name, TopicOptions::default())
    }

    /// Create a topic.
    ///
    /// A closed topic's name may be reused.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if a topic with this name exists and was not closed.
    pub fn create_topic_with(&self, name: &str, opts: TopicOptions) -> Result<Topic> {
        // ---
        let driver = {
            let mut topics = lock_ignore_poison(&self.topics);
            if topics.get(name).is_some_and(|t| !t.is_closed()) {
                return Err(not_registered(MemoryError::TopicExists(name.to_string())));
            }
            let driver = MemoryTopic::new(name);
            topics.insert(name.to_string(), driver.clone());
            driver
        };

        crate::log_info!("memory: created topic {name:?}");
        Ok(TopicBuilder::new(Arc::new(driver)).options(opts).build())
    }

    /// Open a subscription to a topic with default options.
    ///
    /// # Errors
    ///
    /// `NotFound` if no topic with this name exists.
    pub fn open_subscription(&self, topic: &str, ack_deadline: Duration) -> Result<Subscription> {
        self.open_subscription_with(topic, ack_deadline, SubscriptionOptions::default())
    }

    /// Open a subscription to a topic.
    ///
    /// The subscription receives messages sent after this call returns.
    ///
    /// # Errors
    ///
    /// `NotFound` if no topic with this name exists.
    pub fn open_subscription_with(
        &self,
        topic: &str,
        ack_deadline: Duration,
        opts: SubscriptionOptions,
    ) -> Result<Subscription> {
        // ---
        let driver = self
            .topic_driver(topic)
            .ok_or_else(|| not_registered(MemoryError::TopicNotFound(topic.to_string())))?;

        let sub = MemorySubscription::new(&driver, ack_deadline);
        Ok(SubscriptionBuilder::new(Arc::new(sub)).options(opts).build())
    }

    /// The driver behind a registered topic.
    pub fn topic_driver(&self, name: &str) -> Option<MemoryTopic> {
        lock_ignore_poison(&self.topics).get(name).cloned()
    }
}

#[track_caller]
fn not_registered(err: MemoryError) -> Error {
    Error::wrap(err.code(), err, "pubsub")
}
