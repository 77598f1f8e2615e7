//! Cancellation and deadline propagation.
//!
//! A [`Context`] is handed to every operation that may suspend. It combines a
//! [`CancellationToken`] with an optional deadline; derived contexts inherit
//! both from their parent and may only tighten them.
//!
//! ```
//! # use mom_pubsub::Context;
//! # use std::time::Duration;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (ctx, cancel) = Context::background().with_cancel();
//! let ctx = ctx.with_timeout(Duration::from_secs(5));
//!
//! cancel.cancel();
//! assert!(ctx.err().is_some());
//! # }
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ContextError {
    /// The context was canceled explicitly.
    #[error("context canceled")]
    Canceled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation scope passed to every suspending operation.
///
/// Cloning is cheap; clones share the same cancellation state.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        // ---
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child context along with the token that cancels it.
    ///
    /// Canceling the returned token cancels the child (and its descendants)
    /// but not `self`.
    pub fn with_cancel(&self) -> (Context, CancellationToken) {
        // ---
        let token = self.token.child_token();
        let ctx = Context {
            token: token.clone(),
            deadline: self.deadline,
        };
        (ctx, token)
    }

    /// Derive a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        // ---
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`, or at the parent's
    /// deadline if that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        // ---
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Context {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// The deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is done, or `None` while it is still live.
    ///
    /// Cancellation takes precedence over an elapsed deadline.
    pub fn err(&self) -> Option<ContextError> {
        // ---
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context is done and return why.
    ///
    /// Cancel safe: dropping the future has no side effects.
    pub async fn done(&self) -> ContextError {
        // ---
        if let Some(err) = self.err() {
            return err;
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Sleep for `duration`, returning early with the reason if the context
    /// is done first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        // ---
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_background_is_never_done() {
        // ---
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.deadline(), None);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        // ---
        let parent = Context::background();
        let (child, cancel) = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        cancel.cancel();

        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
        assert_eq!(parent.err(), None);
        assert_eq!(grandchild.done().await, ContextError::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        // ---
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        assert_eq!(ctx.err(), None);

        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_cannot_extend_parent_deadline() {
        // ---
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_interrupted_by_cancel() {
        // ---
        let (ctx, cancel) = Context::background().with_cancel();

        let sleeper = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.sleep(Duration::from_secs(3600)).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = sleeper.await.expect("sleeper panicked");
        assert_eq!(result, Err(ContextError::Canceled));
    }
}
