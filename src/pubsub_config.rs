//! Public, driver-agnostic Topic and Subscription configuration.
//!
//! These types intentionally contain no backend-specific concepts. Drivers
//! report their own preferred batching limits, which are merged with the
//! values configured here when the façade is built.

use std::time::Duration;

use serde::Deserialize;

use crate::{BackoffPolicy, BatcherOptions};

/// Configuration for a [`Topic`](crate::Topic).
///
/// # Example
///
/// ```
/// use mom_pubsub::{BatcherOptions, TopicOptions};
///
/// let opts = TopicOptions::default().with_batcher(BatcherOptions {
///     max_batch_size: 100,
///     max_handlers: 4,
/// });
/// assert_eq!(opts.batcher.max_handlers, 4);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopicOptions {
    /// Limits for grouping sends into `send_batch` calls.
    ///
    /// Unset (zero) limits take the driver's
    /// [`batch_options`](crate::TopicDriver::batch_options).
    pub batcher: BatcherOptions,

    /// Backoff applied when the driver reports a send error as retryable.
    pub retry: BackoffPolicy,
}

impl TopicOptions {
    /// Replace the send batching limits.
    pub fn with_batcher(mut self, batcher: BatcherOptions) -> Self {
        self.batcher = batcher;
        self
    }

    /// Replace the retry backoff policy.
    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for a [`Subscription`](crate::Subscription).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// Limits for concurrent `receive_batch` calls.
    ///
    /// Receive requests from waiting callers are grouped so that one driver
    /// call serves all of them.
    pub receive_batcher: BatcherOptions,

    /// Limits for grouping acks and nacks into `send_acks` / `send_nacks`.
    ///
    /// Unset (zero) limits take the driver's
    /// [`ack_batch_options`](crate::SubscriptionDriver::ack_batch_options).
    pub ack_batcher: BatcherOptions,

    /// Backoff applied when the driver reports an error as retryable.
    pub retry: BackoffPolicy,

    /// Minimum number of messages requested per `receive_batch` call.
    ///
    /// Default: 10
    pub receive_batch_size: usize,

    /// Wall-clock ceiling for a single `receive_batch` call.
    ///
    /// When it elapses the call is treated as an empty batch and retried, so
    /// an idle backend never blocks `receive` indefinitely.
    ///
    /// Default: 5 seconds
    pub receive_batch_timeout: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        // ---
        Self {
            receive_batcher: BatcherOptions::default(),
            ack_batcher: BatcherOptions::default(),
            retry: BackoffPolicy::default(),
            receive_batch_size: 10,
            receive_batch_timeout: Duration::from_secs(5),
        }
    }
}

impl SubscriptionOptions {
    /// Replace the receive batching limits.
    pub fn with_receive_batcher(mut self, batcher: BatcherOptions) -> Self {
        self.receive_batcher = batcher;
        self
    }

    /// Replace the ack/nack batching limits.
    pub fn with_ack_batcher(mut self, batcher: BatcherOptions) -> Self {
        self.ack_batcher = batcher;
        self
    }

    /// Replace the retry backoff policy.
    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the minimum number of messages requested per driver call.
    pub fn with_receive_batch_size(mut self, size: usize) -> Self {
        self.receive_batch_size = size.max(1);
        self
    }

    /// Set the ceiling for a single driver receive call.
    pub fn with_receive_batch_timeout(mut self, timeout: Duration) -> Self {
        self.receive_batch_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_subscription_defaults() {
        // ---
        let opts = SubscriptionOptions::default();
        assert_eq!(opts.receive_batch_size, 10);
        assert_eq!(opts.receive_batch_timeout, Duration::from_secs(5));
        // Unset, so the driver's preference applies when merged.
        assert_eq!(opts.ack_batcher, BatcherOptions::default());
        assert_eq!(opts.ack_batcher.max_handlers, 0);
        assert_eq!(TopicOptions::default().batcher.max_handlers, 0);
    }

    #[test]
    fn test_batch_size_is_at_least_one() {
        // ---
        let opts = SubscriptionOptions::default().with_receive_batch_size(0);
        assert_eq!(opts.receive_batch_size, 1);
    }
}
