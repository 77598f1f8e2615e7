// src/domain/driver.rs

//! Driver contract.
//!
//! This module defines the interface pair a backend adapter implements so the
//! [`Topic`](crate::Topic) and [`Subscription`](crate::Subscription) façades
//! can run on top of it. It intentionally avoids any reference to concrete
//! brokers or client libraries.
//!
//! Drivers are responsible only for moving [`Envelope`]s and acknowledging
//! deliveries. Batching, retries, cancellation and lifecycle are handled by
//! the façade, which guarantees that:
//!
//! - `send_batch`, `receive_batch`, `send_acks` and `send_nacks` may be called
//!   concurrently, up to the configured `max_handlers`;
//! - `close` is called exactly once, after which no other method is called
//!   by the façade (detached in-flight calls may still be running);
//! - every error returned by the driver is classified through the driver's
//!   own `error_code` / `is_retryable`.
//!
//! The in-memory driver is the reference implementation of these semantics.
//!
//! # Notes
//!
//! These traits use `async_trait`; the expanded documentation may show
//! explicit lifetimes and a boxed `Future`. Implementors should treat the
//! methods as normal `async fn`s.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;

use crate::driver::memory::{MemoryError, MemorySubscription, MemoryTopic};
use crate::{BatcherOptions, Context, ErrorCode};

/// Error type returned by driver methods.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A driver error as seen by classification methods.
pub type DriverError = dyn StdError + Send + Sync + 'static;

/// Opaque handle identifying one delivery of a message.
///
/// An `AckId` names a delivery attempt, not a message: when a message is
/// redelivered it carries a new `AckId`. Drivers pick whichever variant fits
/// their backend; the façade never looks inside.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AckId {
    /// Numeric handle (sequence numbers, offsets, delivery tags).
    Seq(u64),
    /// Backend-specific token (receipt handles, encoded message ids).
    Token(Bytes),
}

impl From<u64> for AckId {
    fn from(value: u64) -> Self {
        AckId::Seq(value)
    }
}

/// A message as exchanged with drivers.
///
/// Envelopes handed to [`TopicDriver::send_batch`] are borrowed immutably;
/// envelopes returned from [`SubscriptionDriver::receive_batch`] are owned by
/// the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Opaque payload bytes.
    pub body: Bytes,

    /// Application metadata. Keys are unique; order is irrelevant.
    pub metadata: HashMap<String, String>,

    /// Delivery handle. Always `Some` on received envelopes, `None` on
    /// envelopes being sent.
    pub ack_id: Option<AckId>,

    /// Human-readable identifier used in logs only.
    pub loggable_id: Option<String>,
}

impl Envelope {
    /// Create an envelope for sending.
    pub fn new(body: impl Into<Bytes>, metadata: HashMap<String, String>) -> Self {
        // ---
        Self {
            body: body.into(),
            metadata,
            ack_id: None,
            loggable_id: None,
        }
    }
}

/// Backend-native handles a driver can expose.
///
/// This is the escape hatch for callers that need backend-specific features:
/// ask the driver, match on the variant for the backend you expect.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum NativeRef<'a> {
    /// The in-memory topic driver.
    MemoryTopic(&'a MemoryTopic),
    /// The in-memory subscription driver.
    MemorySubscription(&'a MemorySubscription),
}

/// Backend-native errors a driver can recognize.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum NativeError<'e> {
    /// An error raised by the in-memory driver.
    Memory(&'e MemoryError),
}

/// Topic side of the driver contract.
#[async_trait::async_trait]
pub trait TopicDriver: Send + Sync {
    // ---
    /// Publish a batch of envelopes.
    ///
    /// Either all envelopes were handed to the backend (`Ok`) or the batch
    /// failed as a whole. Implementations should honor `ctx` cancellation.
    async fn send_batch(&self, ctx: &Context, msgs: &[Envelope]) -> Result<(), BoxError>;

    /// Whether `err` is transient and the call that produced it may be
    /// retried with backoff.
    fn is_retryable(&self, err: &DriverError) -> bool;

    /// Map a driver error to a portable code.
    fn error_code(&self, err: &DriverError) -> ErrorCode;

    /// Release backend resources.
    async fn close(&self) -> Result<(), BoxError>;

    /// Expose the backend-native handle, if the driver has one.
    fn as_native(&self) -> Option<NativeRef<'_>> {
        None
    }

    /// Recognize a backend-native error inside `err`.
    fn error_as<'e>(&self, _err: &'e DriverError) -> Option<NativeError<'e>> {
        None
    }

    /// Batching limits the backend prefers for `send_batch`.
    ///
    /// Zero fields mean "no preference".
    fn batch_options(&self) -> BatcherOptions {
        BatcherOptions {
            max_batch_size: 0,
            max_handlers: 0,
        }
    }
}

/// Subscription side of the driver contract.
#[async_trait::async_trait]
pub trait SubscriptionDriver: Send + Sync {
    // ---
    /// Receive up to `max_messages` envelopes.
    ///
    /// May block until at least one envelope is available or `ctx` is done.
    /// Returning an empty batch is allowed; the façade will ask again.
    async fn receive_batch(
        &self,
        ctx: &Context,
        max_messages: usize,
    ) -> Result<Vec<Envelope>, BoxError>;

    /// Acknowledge deliveries. Unknown or already acknowledged ids must be
    /// ignored.
    async fn send_acks(&self, ctx: &Context, ack_ids: &[AckId]) -> Result<(), BoxError>;

    /// Negatively acknowledge deliveries, making them eligible for
    /// redelivery. Only called when [`can_nack`](Self::can_nack) is `true`.
    async fn send_nacks(&self, ctx: &Context, ack_ids: &[AckId]) -> Result<(), BoxError>;

    /// Whether the backend supports `send_nacks`.
    fn can_nack(&self) -> bool;

    /// Whether `err` is transient and the call that produced it may be
    /// retried with backoff.
    fn is_retryable(&self, err: &DriverError) -> bool;

    /// Map a driver error to a portable code.
    fn error_code(&self, err: &DriverError) -> ErrorCode;

    /// Release backend resources.
    async fn close(&self) -> Result<(), BoxError>;

    /// Expose the backend-native handle, if the driver has one.
    fn as_native(&self) -> Option<NativeRef<'_>> {
        None
    }

    /// Recognize a backend-native error inside `err`.
    fn error_as<'e>(&self, _err: &'e DriverError) -> Option<NativeError<'e>> {
        None
    }

    /// Batching limits the backend prefers for `send_acks` / `send_nacks`.
    ///
    /// Zero fields mean "no preference".
    fn ack_batch_options(&self) -> BatcherOptions {
        BatcherOptions {
            max_batch_size: 0,
            max_handlers: 0,
        }
    }
}

/// Shared topic driver pointer.
pub type TopicDriverPtr = Arc<dyn TopicDriver>;

/// Shared subscription driver pointer.
pub type SubscriptionDriverPtr = Arc<dyn SubscriptionDriver>;
