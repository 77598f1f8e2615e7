//! Topic and Subscription builders.
//!
//! Provide a fluent API for wrapping an already constructed driver in the
//! façade, with batching, retry and observer settings.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{SubscriptionDriverPtr, TopicDriverPtr};
use crate::{
    // ---
    CallObserver,
    LogObserver,
    Subscription,
    SubscriptionOptions,
    Topic,
    TopicOptions,
};

/// Builder for [`Topic`] instances.
///
/// # Example
///
/// ```
/// use mom_pubsub::{MemoryTopic, TopicBuilder};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let driver = MemoryTopic::new("orders");
///
/// let topic = TopicBuilder::new(Arc::new(driver))
///     .max_batch_size(100)
///     .max_handlers(4)
///     .retry_initial_delay(Duration::from_millis(50))
///     .build();
/// # let _ = topic;
/// # }
/// ```
pub struct TopicBuilder {
    // ---
    driver: TopicDriverPtr,
    opts: TopicOptions,
    observer: Option<Arc<dyn CallObserver>>,
}

impl TopicBuilder {
    /// Create a builder around `driver` with default options.
    pub fn new(driver: TopicDriverPtr) -> Self {
        // ---
        Self {
            driver,
            opts: TopicOptions::default(),
            observer: None,
        }
    }

    /// Replace all options at once.
    pub fn options(mut self, opts: TopicOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Maximum number of messages per `send_batch` call (0 = no limit).
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.opts.batcher.max_batch_size = size;
        self
    }

    /// Maximum number of concurrent `send_batch` calls.
    ///
    /// Default: 1.
    pub fn max_handlers(mut self, handlers: usize) -> Self {
        self.opts.batcher.max_handlers = handlers;
        self
    }

    /// Set retry backoff multiplier.
    ///
    /// Default: 2.0 (exponential backoff).
    pub fn retry_multiplier(mut self, multiplier: f32) -> Self {
        self.opts.retry.multiplier = multiplier;
        self
    }

    /// Set initial delay before first retry.
    ///
    /// Default: 100ms.
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.opts.retry.initial_delay = delay;
        self
    }

    /// Set maximum delay between retry attempts.
    ///
    /// Default: 5s.
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.opts.retry.max_delay = delay;
        self
    }

    /// Report every call to `observer` instead of the default log line.
    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the topic (consumes self).
    pub fn build(self) -> Topic {
        // ---
        let observer = self.observer.unwrap_or_else(|| Arc::new(LogObserver));
        Topic::with_observer(self.driver, self.opts, observer)
    }
}

/// Builder for [`Subscription`] instances.
pub struct SubscriptionBuilder {
    // ---
    driver: SubscriptionDriverPtr,
    opts: SubscriptionOptions,
    observer: Option<Arc<dyn CallObserver>>,
}

impl SubscriptionBuilder {
    /// Create a builder around `driver` with default options.
    pub fn new(driver: SubscriptionDriverPtr) -> Self {
        // ---
        Self {
            driver,
            opts: SubscriptionOptions::default(),
            observer: None,
        }
    }

    /// Replace all options at once.
    pub fn options(mut self, opts: SubscriptionOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Minimum number of messages requested per `receive_batch` call.
    ///
    /// Default: 10.
    pub fn receive_batch_size(mut self, size: usize) -> Self {
        self.opts = self.opts.with_receive_batch_size(size);
        self
    }

    /// Ceiling for a single `receive_batch` call.
    ///
    /// Default: 5s.
    pub fn receive_batch_timeout(mut self, timeout: Duration) -> Self {
        self.opts.receive_batch_timeout = timeout;
        self
    }

    /// Maximum number of concurrent `receive_batch` calls.
    ///
    /// Default: 1.
    pub fn receive_max_handlers(mut self, handlers: usize) -> Self {
        self.opts.receive_batcher.max_handlers = handlers;
        self
    }

    /// Maximum number of ids per `send_acks` / `send_nacks` call
    /// (0 = no limit).
    pub fn ack_max_batch_size(mut self, size: usize) -> Self {
        self.opts.ack_batcher.max_batch_size = size;
        self
    }

    /// Maximum number of concurrent `send_acks` / `send_nacks` calls.
    ///
    /// Default: 1.
    pub fn ack_max_handlers(mut self, handlers: usize) -> Self {
        self.opts.ack_batcher.max_handlers = handlers;
        self
    }

    /// Set initial delay before first retry.
    ///
    /// Default: 100ms.
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.opts.retry.initial_delay = delay;
        self
    }

    /// Set maximum delay between retry attempts.
    ///
    /// Default: 5s.
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.opts.retry.max_delay = delay;
        self
    }

    /// Report every call to `observer` instead of the default log line.
    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the subscription (consumes self).
    pub fn build(self) -> Subscription {
        // ---
        let observer = self.observer.unwrap_or_else(|| Arc::new(LogObserver));
        Subscription::with_observer(self.driver, self.opts, observer)
    }
}
