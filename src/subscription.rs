// src/subscription.rs

//! Receiving side of the façade.
//!
//! A [`Subscription`] keeps a buffer of envelopes fetched from its driver.
//! [`receive`](Subscription::receive) pops from that buffer and, when it is
//! empty, joins a fetch on the receive batcher so that callers waiting at the
//! same time share one `receive_batch` call. Each fetch is bounded by
//! `receive_batch_timeout`; an idle backend therefore shows up as a series
//! of empty fetches, never as an error.
//!
//! Acknowledgements go through a second batcher that groups them into
//! `send_acks` / `send_nacks` calls. A non-retryable failure of either
//! batcher becomes the subscription's permanent error: every later
//! `receive` returns it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    AckId, BoxError, DriverError, Envelope, NativeError, NativeRef, SubscriptionDriverPtr,
};
use crate::error::{from_batch, from_driver, from_retry, shut_down};
use crate::lock::lock_ignore_poison;
use crate::message::{AckBatcher, AckRequest};
use crate::observer::{CallObserverPtr, CallTimer, LogObserver};
use crate::{
    // ---
    retry,
    BackoffPolicy,
    Batcher,
    CallObserver,
    Context,
    Error,
    ErrorCode,
    Lifecycle,
    Message,
    Result,
    SubscriptionOptions,
};

/// Pause after a fetch that returned nothing, so drivers that do not block
/// in `receive_batch` are not polled in a tight loop.
const EMPTY_BATCH_PAUSE: Duration = Duration::from_millis(10);

/// A handle for receiving messages.
///
/// `.clone()` is cheap; clones share the same buffer, batchers and
/// lifecycle.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    receiver: Batcher<(), (), Error>,
    acks: AckBatcher,
    can_nack: bool,
    // Canceled first on shutdown; stops in-flight fetches.
    recv_cancel: CancellationToken,
    // Canceled once acks are drained (or shutdown is interrupted).
    cancel: CancellationToken,
    observer: CallObserverPtr,
}

/// State shared with the batch handlers.
struct Shared {
    driver: SubscriptionDriverPtr,
    state: Mutex<State>,
}

struct State {
    lifecycle: Lifecycle,
    queue: VecDeque<Envelope>,
    err: Option<Error>,
}

impl Shared {
    fn classify(&self) -> impl Fn(&DriverError) -> ErrorCode + '_ {
        |err: &DriverError| self.driver.error_code(err)
    }

    fn buffer(&self, msgs: Vec<Envelope>) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.queue.extend(msgs);
    }

    fn fail(&self, err: &Error) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.err.is_none() {
            crate::log_error!("pubsub: subscription failed permanently: {err}");
            state.err = Some(err.clone());
        }
    }

    /// Fetch one batch into the buffer.
    ///
    /// `base` is canceled when the subscription shuts down.
    async fn fetch(
        &self,
        base: &Context,
        max_messages: usize,
        timeout: Duration,
        policy: &BackoffPolicy,
    ) -> Result<()> {
        // ---
        let ctx = base.with_timeout(timeout);
        let mut backoff = policy.start();

        let result = retry::call(
            &ctx,
            &mut backoff,
            |err: &BoxError| self.driver.is_retryable(&**err),
            || self.driver.receive_batch(&ctx, max_messages),
        )
        .await;

        match result {
            Ok(msgs) if msgs.is_empty() => {
                let _ = base.sleep(EMPTY_BATCH_PAUSE).await;
                Ok(())
            }
            Ok(msgs) => {
                crate::log_debug!("pubsub: fetched {} message(s)", msgs.len());
                self.buffer(msgs);
                Ok(())
            }
            Err(err) => {
                if let Some(ctx_err) = base.err() {
                    return Err(Error::from_context(ctx_err));
                }
                if ctx.err().is_some() {
                    // The per-fetch ceiling elapsed: same as an empty batch.
                    return Ok(());
                }
                let err = from_retry(err, self.classify());
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Send one batch of acknowledgements.
    async fn settle(
        &self,
        ctx: &Context,
        requests: Vec<AckRequest>,
        policy: &BackoffPolicy,
        observer: &dyn CallObserver,
    ) -> Result<()> {
        // ---
        let mut acks: Vec<AckId> = Vec::new();
        let mut nacks: Vec<AckId> = Vec::new();
        for request in requests {
            match request {
                AckRequest::Ack(id) => acks.push(id),
                AckRequest::Nack(id) => nacks.push(id),
            }
        }

        if !acks.is_empty() {
            let timer = CallTimer::start(observer, "Subscription.SendAcks");
            let result = retry::call(
                ctx,
                &mut policy.start(),
                |err: &BoxError| self.driver.is_retryable(&**err),
                || self.driver.send_acks(ctx, &acks),
            )
            .await
            .map_err(|err| from_retry(err, self.classify()));
            self.settled(ctx, timer.finish(result))?;
        }

        if !nacks.is_empty() {
            let timer = CallTimer::start(observer, "Subscription.SendNacks");
            let result = retry::call(
                ctx,
                &mut policy.start(),
                |err: &BoxError| self.driver.is_retryable(&**err),
                || self.driver.send_nacks(ctx, &nacks),
            )
            .await
            .map_err(|err| from_retry(err, self.classify()));
            self.settled(ctx, timer.finish(result))?;
        }

        Ok(())
    }

    fn settled(&self, ctx: &Context, result: Result<()>) -> Result<()> {
        // ---
        if let Err(err) = &result {
            if ctx.err().is_none() {
                self.fail(err);
            }
        }
        result
    }
}

impl Subscription {
    /// Wrap a driver with the default call observer.
    pub fn new(driver: SubscriptionDriverPtr, opts: SubscriptionOptions) -> Self {
        Self::with_observer(driver, opts, Arc::new(LogObserver))
    }

    /// Wrap a driver, reporting every call to `observer`.
    pub fn with_observer(
        driver: SubscriptionDriverPtr,
        opts: SubscriptionOptions,
        observer: CallObserverPtr,
    ) -> Self {
        // ---
        let (background, cancel) = Context::background().with_cancel();
        let (recv_ctx, recv_cancel) = background.with_cancel();
        let can_nack = driver.can_nack();
        let ack_opts = opts.ack_batcher.merged(&driver.ack_batch_options());

        let shared = Arc::new(Shared {
            driver,
            state: Mutex::new(State {
                lifecycle: Lifecycle::Open,
                queue: VecDeque::new(),
                err: None,
            }),
        });

        let receiver = Batcher::new(opts.receive_batcher, {
            let shared = shared.clone();
            let policy = opts.retry.clone();
            let batch_size = opts.receive_batch_size.max(1);
            let timeout = opts.receive_batch_timeout;
            move |waiters: Vec<()>| {
                let shared = shared.clone();
                let policy = policy.clone();
                let base = recv_ctx.clone();
                let max_messages = waiters.len().max(batch_size);
                async move { shared.fetch(&base, max_messages, timeout, &policy).await }
            }
        });

        let acks = Batcher::new(ack_opts, {
            let shared = shared.clone();
            let policy = opts.retry;
            let observer = observer.clone();
            move |requests: Vec<AckRequest>| {
                let shared = shared.clone();
                let policy = policy.clone();
                let observer = observer.clone();
                let ctx = background.clone();
                async move {
                    shared
                        .settle(&ctx, requests, &policy, observer.as_ref())
                        .await
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                shared,
                receiver,
                acks,
                can_nack,
                recv_cancel,
                cancel,
                observer,
            }),
        }
    }

    /// Receive the next message.
    ///
    /// Waits until a message is available or `ctx` is done. The returned
    /// message must be acknowledged with [`Message::ack`] (or
    /// [`Message::nack`]); otherwise it is redelivered once the driver's ack
    /// deadline expires.
    ///
    /// # Errors
    ///
    /// - `FailedPrecondition` after [`shutdown`](Self::shutdown)
    /// - `Canceled` / `DeadlineExceeded` when `ctx` finishes first
    /// - the subscription's permanent error, once a receive or ack failed
    ///   with a non-retryable driver error
    pub async fn receive(&self, ctx: &Context) -> Result<Message> {
        // ---
        let timer = CallTimer::start(self.inner.observer.as_ref(), "Subscription.Receive");
        timer.finish(self.receive_inner(ctx).await)
    }

    async fn receive_inner(&self, ctx: &Context) -> Result<Message> {
        // ---
        loop {
            if let Some(msg) = self.next_buffered(ctx)? {
                return Ok(msg);
            }

            let fetched = tokio::select! {
                res = self.inner.receiver.add(ctx, ()) => res,
                _ = self.inner.recv_cancel.cancelled() => return Err(shut_down("Subscription")),
            };
            if let Err(err) = fetched {
                if self.state() != Lifecycle::Open {
                    return Err(shut_down("Subscription"));
                }
                return Err(from_batch(err, "Subscription"));
            }
        }
    }

    fn next_buffered(&self, ctx: &Context) -> Result<Option<Message>> {
        // ---
        let mut state = lock_ignore_poison(&self.inner.shared.state);
        if state.lifecycle != Lifecycle::Open {
            return Err(shut_down("Subscription"));
        }
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        if let Some(err) = ctx.err() {
            return Err(Error::from_context(err));
        }

        Ok(state
            .queue
            .pop_front()
            .map(|envelope| Message::received(envelope, &self.inner.acks, self.inner.can_nack)))
    }

    /// Stop receiving, flush pending acknowledgements, then close the
    /// driver.
    ///
    /// In-flight fetches are canceled. Messages that were fetched but never
    /// handed out are nacked when the driver supports it, so they are
    /// redelivered without waiting for their ack deadline.
    ///
    /// # Errors
    ///
    /// - `FailedPrecondition` if shutdown was already called
    /// - `Canceled` / `DeadlineExceeded` if `ctx` finished while draining
    /// - the driver's close error
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        // ---
        let timer = CallTimer::start(self.inner.observer.as_ref(), "Subscription.Shutdown");
        timer.finish(self.shutdown_inner(ctx).await)
    }

    async fn shutdown_inner(&self, ctx: &Context) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.inner.shared.state);
            if state.lifecycle != Lifecycle::Open {
                return Err(shut_down("Subscription"));
            }
            state.lifecycle = Lifecycle::ShuttingDown;
        }

        let started = Instant::now();
        self.inner.recv_cancel.cancel();

        let drain = async {
            self.inner.receiver.shutdown().await;
            self.nack_buffered();
            self.inner.acks.shutdown().await;
        };
        let interrupted = tokio::select! {
            biased;
            _ = drain => None,
            err = ctx.done() => Some(err),
        };

        self.inner.acks.close();
        self.inner.cancel.cancel();
        {
            let mut state = lock_ignore_poison(&self.inner.shared.state);
            state.lifecycle = Lifecycle::Closed;
            state.queue.clear();
        }

        let driver = &self.inner.shared.driver;
        let closed = driver
            .close()
            .await
            .map_err(|err| from_driver(err, |e| driver.error_code(e)));

        if let Some(err) = interrupted {
            crate::log_warn!("pubsub: Subscription shutdown interrupted: {err}");
            return Err(Error::from_context(err));
        }
        crate::log_debug!("pubsub: Subscription drained in {:?}", started.elapsed());
        closed
    }

    fn nack_buffered(&self) {
        // ---
        let buffered: Vec<Envelope> = {
            let mut state = lock_ignore_poison(&self.inner.shared.state);
            state.queue.drain(..).collect()
        };
        if buffered.is_empty() {
            return;
        }

        if !self.inner.can_nack {
            crate::log_debug!(
                "pubsub: dropping {} buffered message(s); they are redelivered after their ack deadline",
                buffered.len()
            );
            return;
        }

        for ack_id in buffered.into_iter().filter_map(|envelope| envelope.ack_id) {
            // Closed batcher means shutdown already gave up on acks.
            let _ = self.inner.acks.add_no_wait(AckRequest::Nack(ack_id));
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        lock_ignore_poison(&self.inner.shared.state).lifecycle
    }

    /// Whether the driver supports [`Message::nack`].
    pub fn can_nack(&self) -> bool {
        self.inner.can_nack
    }

    /// Backend-native handle of the underlying driver, if it exposes one.
    pub fn as_native(&self) -> Option<NativeRef<'_>> {
        self.inner.shared.driver.as_native()
    }

    /// Backend-native error behind `err`, if the driver recognizes one.
    pub fn error_as<'e>(&self, err: &'e Error) -> Option<NativeError<'e>> {
        err.cause()
            .and_then(|cause| self.inner.shared.driver.error_as(cause))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("state", &self.state())
            .field("can_nack", &self.inner.can_nack)
            .finish()
    }
}
