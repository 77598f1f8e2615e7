//! Domain layer public interface.
//!
//! This module defines the driver contract, which is independent of any
//! broker, client library or the façade built on top of it.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod driver;

// --- Driver domain re-exports ---

pub use driver::{
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
