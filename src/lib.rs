//! Backend-agnostic publish/subscribe with at-least-once delivery
//!
//! This library provides a single [`Topic`] / [`Subscription`] API on top of
//! pluggable message-transport drivers. It handles batching of concurrent
//! calls, bounded concurrency towards the backend, retries of transient
//! driver failures, ack-deadline redelivery, and responsive cancellation.
//!
//! Drivers implement [`TopicDriver`] and [`SubscriptionDriver`]; the crate
//! ships an in-memory reference driver ([`MemoryBroker`], [`MemoryTopic`],
//! [`MemorySubscription`]).
//!

// Import all sub modules once...
mod domain;
mod driver;
mod lock;
mod macros;

mod batcher;
mod builder;
mod context;
mod error;
mod message;
mod observer;
mod pubsub_config;
mod subscription;
mod topic;

pub mod retry;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use subscription::Subscription;
pub use topic::{Lifecycle, Topic};

pub use builder::{SubscriptionBuilder, TopicBuilder};
pub use pubsub_config::{SubscriptionOptions, TopicOptions};

pub use batcher::{BatchError, Batcher, BatcherOptions, Completion};
pub use context::{Context, ContextError};
pub use error::{code, code_of, Cause, Error, ErrorCode, Result};
pub use message::Message;
pub use observer::{CallObserver, CallObserverPtr, LogObserver};
pub use retry::{Backoff, BackoffPolicy, ExponentialBackoff, RetryError};

pub use driver::memory::{MemoryBroker, MemoryError, MemorySubscription, MemoryTopic};

// --- public re-exports
pub use domain::{
    //
    AckId,
    BoxError,
    DriverError,
    Envelope,
    NativeError,
    NativeRef,
    SubscriptionDriver,
    SubscriptionDriverPtr,
    TopicDriver,
    TopicDriverPtr,
};
