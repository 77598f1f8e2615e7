// src/observer.rs

//! Per-call observation hook.
//!
//! Every public façade call that may block reports the method name, the
//! resulting [`ErrorCode`] and the call latency to a [`CallObserver`]. The
//! crate does not emit metrics or traces itself; plug an observer in to bridge
//! to whatever telemetry system the application uses.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::{code_of, ErrorCode, Result};

/// Receives one record per public façade call.
pub trait CallObserver: Send + Sync {
    /// Record a finished call.
    ///
    /// `method` is a static name such as `"Topic.Send"`. Implementations must
    /// not block; they run inline on the caller's task.
    fn record(&self, method: &'static str, code: ErrorCode, latency: Duration);
}

/// Shared observer pointer.
pub type CallObserverPtr = Arc<dyn CallObserver>;

/// Default observer: one debug-level log line per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl CallObserver for LogObserver {
    fn record(&self, method: &'static str, code: ErrorCode, latency: Duration) {
        // ---
        crate::log_debug!("{method} finished: code={code} latency={latency:?}");
    }
}

/// Measures one call and reports it on [`finish`](Self::finish).
pub(crate) struct CallTimer<'a> {
    observer: &'a dyn CallObserver,
    method: &'static str,
    started: Instant,
}

impl<'a> CallTimer<'a> {
    pub(crate) fn start(observer: &'a dyn CallObserver, method: &'static str) -> Self {
        // ---
        Self {
            observer,
            method,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish<T>(self, result: Result<T>) -> Result<T> {
        // ---
        self.observer
            .record(self.method, code_of(&result), self.started.elapsed());
        result
    }
}
