//! Driver implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`TopicDriver`](crate::TopicDriver) and
//! [`SubscriptionDriver`](crate::SubscriptionDriver) traits. Vendor broker
//! adapters live in their own crates and plug in through the same traits.
//!
//! Domain code must not depend on driver-specific types beyond the tagged
//! variants of [`NativeRef`](crate::NativeRef) and
//! [`NativeError`](crate::NativeError).

pub(crate) mod memory;
