// src/topic.rs

//! Publishing side of the façade.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::domain::{BoxError, Envelope, NativeError, NativeRef, TopicDriverPtr};
use crate::error::{from_batch, from_driver, from_retry, shut_down};
use crate::lock::lock_ignore_poison;
use crate::observer::{CallObserverPtr, CallTimer, LogObserver};
use crate::{retry, Batcher, Context, Error, Message, Result, TopicOptions};

/// Lifecycle of a [`Topic`] or [`Subscription`](crate::Subscription).
///
/// `Open → ShuttingDown → Closed`. Only `Open` accepts new work; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting new sends or receives.
    Open,
    /// `shutdown` is draining in-flight work.
    ShuttingDown,
    /// The driver has been closed.
    Closed,
}

/// A handle for publishing messages.
///
/// Concurrent [`send`](Self::send) calls are grouped into driver
/// `send_batch` calls. `.clone()` is cheap; clones share the same batcher
/// and lifecycle.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<Inner>,
}

struct Inner {
    driver: TopicDriverPtr,
    batcher: Batcher<Envelope, (), Error>,
    state: Mutex<Lifecycle>,
    // Canceled by shutdown; bounds retries of in-flight batches.
    cancel: CancellationToken,
    observer: CallObserverPtr,
}

impl Topic {
    /// Wrap a driver with the default call observer.
    pub fn new(driver: TopicDriverPtr, opts: TopicOptions) -> Self {
        Self::with_observer(driver, opts, Arc::new(LogObserver))
    }

    /// Wrap a driver, reporting every call to `observer`.
    pub fn with_observer(
        driver: TopicDriverPtr,
        opts: TopicOptions,
        observer: CallObserverPtr,
    ) -> Self {
        // ---
        let (background, cancel) = Context::background().with_cancel();
        let batch_opts = opts.batcher.merged(&driver.batch_options());

        let batcher = Batcher::new(batch_opts, {
            let driver = driver.clone();
            let policy = opts.retry;
            move |msgs: Vec<Envelope>| {
                let driver = driver.clone();
                let ctx = background.clone();
                let mut backoff = policy.start();
                async move {
                    let result = retry::call(
                        &ctx,
                        &mut backoff,
                        |err: &BoxError| driver.is_retryable(&**err),
                        || driver.send_batch(&ctx, &msgs),
                    )
                    .await;
                    result.map_err(|err| from_retry(err, |e| driver.error_code(e)))
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                driver,
                batcher,
                state: Mutex::new(Lifecycle::Open),
                cancel,
                observer,
            }),
        }
    }

    /// Publish a message.
    ///
    /// Waits until the batch containing the message has been handed to the
    /// driver, or until `ctx` is done.
    ///
    /// # Errors
    ///
    /// - `FailedPrecondition` after [`shutdown`](Self::shutdown)
    /// - `Canceled` / `DeadlineExceeded` when `ctx` finishes first, even if
    ///   the driver call is still running
    /// - the driver's classification of a non-retryable send failure
    pub async fn send(&self, ctx: &Context, msg: Message) -> Result<()> {
        // ---
        let timer = CallTimer::start(self.inner.observer.as_ref(), "Topic.Send");
        timer.finish(self.send_inner(ctx, msg).await)
    }

    async fn send_inner(&self, ctx: &Context, msg: Message) -> Result<()> {
        // ---
        if self.state() != Lifecycle::Open {
            return Err(shut_down("Topic"));
        }
        if let Some(err) = ctx.err() {
            return Err(Error::from_context(err));
        }

        self.inner
            .batcher
            .add(ctx, msg.into_envelope())
            .await
            .map_err(|err| from_batch(err, "Topic"))
    }

    /// Stop accepting sends, wait for in-flight batches, then close the
    /// driver.
    ///
    /// If `ctx` finishes while waiting, in-flight batches are abandoned
    /// (their retries are canceled), the driver is closed and the context
    /// error is returned.
    ///
    /// # Errors
    ///
    /// - `FailedPrecondition` if shutdown was already called
    /// - `Canceled` / `DeadlineExceeded` if `ctx` finished while draining
    /// - the driver's close error
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        // ---
        let timer = CallTimer::start(self.inner.observer.as_ref(), "Topic.Shutdown");
        timer.finish(self.shutdown_inner(ctx).await)
    }

    async fn shutdown_inner(&self, ctx: &Context) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if *state != Lifecycle::Open {
                return Err(shut_down("Topic"));
            }
            *state = Lifecycle::ShuttingDown;
        }

        self.inner.batcher.close();
        let interrupted = tokio::select! {
            biased;
            _ = self.inner.batcher.drained() => None,
            err = ctx.done() => Some(err),
        };

        self.inner.cancel.cancel();
        *lock_ignore_poison(&self.inner.state) = Lifecycle::Closed;

        let driver = &self.inner.driver;
        let closed = driver
            .close()
            .await
            .map_err(|err| from_driver(err, |e| driver.error_code(e)));

        if let Some(err) = interrupted {
            crate::log_warn!("pubsub: Topic shutdown interrupted: {err}");
            return Err(Error::from_context(err));
        }
        closed
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        *lock_ignore_poison(&self.inner.state)
    }

    /// Backend-native handle of the underlying driver, if it exposes one.
    pub fn as_native(&self) -> Option<NativeRef<'_>> {
        self.inner.driver.as_native()
    }

    /// Backend-native error behind `err`, if the driver recognizes one.
    pub fn error_as<'e>(&self, err: &'e Error) -> Option<NativeError<'e>> {
        err.cause().and_then(|cause| self.inner.driver.error_as(cause))
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("state", &self.state())
            .field("batcher", &self.inner.batcher.options())
            .finish()
    }
}
