// src/driver/memory/mod.rs

//! In-memory driver.
//!
//! This module provides a pure in-process implementation of the driver
//! contract. It is intended primarily for testing, local execution, and as a
//! reference for delivery semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory driver defines the **reference behavior** for ack-deadline
//! redelivery. All other drivers are expected to approximate this behavior
//! as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! Each delivered message moves through
//! `Eligible → Delivered(deadline) → { Acked | deadline expires → Eligible }`:
//!
//! - Sending appends new messages as eligible, in publish order, to every
//!   subscription attached to the topic at that time.
//! - A receive selects, in publish order, messages that were never delivered
//!   or whose delivery deadline has passed, and that are not acked. Each
//!   selected message gets a fresh [`AckId`](crate::AckId) and a new deadline
//!   of `now + ack_deadline`.
//! - An acked message is never delivered again.
//! - A nacked message is eligible again immediately.
//!
//! ## Non-Goals
//!
//! This driver does not attempt to emulate the failure modes, persistence,
//! or ordering guarantees of any specific broker. Nothing it returns is
//! retryable.

mod broker;
mod subscription;
mod topic;

pub use broker::MemoryBroker;
pub use subscription::MemorySubscription;
pub use topic::MemoryTopic;

use crate::domain::DriverError;
use crate::{ContextError, ErrorCode};

/// Errors raised by the in-memory driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// No topic is registered under the name.
    #[error("memory: topic {0:?} not found")]
    TopicNotFound(String),

    /// A live topic is already registered under the name.
    #[error("memory: topic {0:?} already exists")]
    TopicExists(String),

    /// The topic driver was closed.
    #[error("memory: topic {0:?} has been closed")]
    TopicClosed(String),

    /// The subscription driver was closed.
    #[error("memory: subscription has been closed")]
    SubscriptionClosed,
}

impl MemoryError {
    /// Portable classification of this error.
    pub fn code(&self) -> ErrorCode {
        // ---
        match self {
            MemoryError::TopicNotFound(_) => ErrorCode::NotFound,
            MemoryError::TopicExists(_) => ErrorCode::AlreadyExists,
            MemoryError::TopicClosed(_) | MemoryError::SubscriptionClosed => {
                ErrorCode::FailedPrecondition
            }
        }
    }
}

fn error_code(err: &DriverError) -> ErrorCode {
    // ---
    if let Some(err) = err.downcast_ref::<MemoryError>() {
        return err.code();
    }
    match err.downcast_ref::<ContextError>() {
        Some(ctx_err) => (*ctx_err).into(),
        None => ErrorCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_error_codes() {
        // ---
        let cases: Vec<(Box<DriverError>, ErrorCode)> = vec![
            (
                Box::new(MemoryError::TopicNotFound("t".into())),
                ErrorCode::NotFound,
            ),
            (
                Box::new(MemoryError::TopicExists("t".into())),
                ErrorCode::AlreadyExists,
            ),
            (
                Box::new(MemoryError::SubscriptionClosed),
                ErrorCode::FailedPrecondition,
            ),
            (Box::new(ContextError::Canceled), ErrorCode::Canceled),
            (
                Box::new(std::io::Error::other("disk")),
                ErrorCode::Unknown,
            ),
        ];

        for (err, want) in cases {
            assert_eq!(error_code(&*err), want, "{err}");
        }
    }
}
