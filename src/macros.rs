// src/macros.rs

//
// Crate-internal logging.
//
// With the `logging` feature every level goes to `tracing` under the
// `mom_pubsub` target. Without it, errors go to stderr and the other levels
// compile to a no-op that still borrows its arguments, so values used only
// for logging do not trigger unused warnings.
//

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "mom_pubsub", $($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("mom_pubsub: {}", format_args!($($arg)*))
    };
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "mom_pubsub", $($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "mom_pubsub", $($arg)*)
    };
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "mom_pubsub", $($arg)*)
    };
}

// Quiet levels without the feature.
#[cfg(not(feature = "logging"))]
macro_rules! log_discard {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::macros::log_discard!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::macros::log_discard!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::macros::log_discard!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
pub(crate) use log_discard;

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
