//! Bounded-concurrency request batcher.
//!
//! A [`Batcher`] turns many independent, concurrently issued requests into
//! fewer calls of a batch handler, while never running more than
//! [`BatcherOptions::max_handlers`] handler calls at once.
//!
//! ## Semantics
//!
//! - Items are queued in arrival order. A free worker drains up to
//!   `max_batch_size` queued items (all of them when `0`) and calls the
//!   handler once with that batch, preserving arrival order.
//! - The handler's outcome is delivered to **every** item of the batch. A
//!   single error fails the whole batch.
//! - Each item is resolved exactly once: a waiter leaves the queue either
//!   inside exactly one batch or through cancellation, never both.
//! - A caller whose context finishes while its item is still queued has the
//!   item removed. Once the item is part of a running batch, the caller still
//!   returns promptly; the handler's eventual result is discarded.
//!
//! ## Lifecycle
//!
//! [`Batcher::close`] stops accepting new items; items already queued are
//! still dispatched. [`Batcher::drained`] waits until no handler is running.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};

use crate::lock::lock_ignore_poison;
use crate::{Context, ContextError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type HandlerFn<I, O, E> = dyn Fn(Vec<I>) -> BoxFuture<'static, Result<O, E>> + Send + Sync;

/// Completion slot handed out by [`Batcher::add_no_wait`].
pub type Completion<O, E> = oneshot::Receiver<Result<O, E>>;

/// Batching limits.
///
/// Zero means "unset" for both fields. An unset limit takes the driver's
/// preference when merged with [`merged`](Self::merged), and falls back to
/// "everything queued" / one handler otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatcherOptions {
    /// Maximum number of items handed to one handler call.
    ///
    /// `0` means "everything currently queued".
    pub max_batch_size: usize,

    /// Maximum number of handler calls running concurrently.
    ///
    /// `0` means unset; a batcher never runs fewer than one handler.
    pub max_handlers: usize,
}

impl BatcherOptions {
    /// Combine these options with limits preferred by a driver.
    ///
    /// The smaller non-zero batch size wins; `max_handlers` is taken from
    /// `self` unless unset, in which case the driver's preference applies.
    /// The result always allows at least one handler.
    pub fn merged(&self, preferred: &BatcherOptions) -> BatcherOptions {
        // ---
        let max_batch_size = match (self.max_batch_size, preferred.max_batch_size) {
            (0, driver) => driver,
            (user, 0) => user,
            (user, driver) => user.min(driver),
        };
        let max_handlers = match self.max_handlers {
            0 => preferred.max_handlers.max(1),
            user => user,
        };

        BatcherOptions {
            max_batch_size,
            max_handlers,
        }
    }

    fn effective_handlers(&self) -> usize {
        self.max_handlers.max(1)
    }
}

/// Why [`Batcher::add`] did not produce the handler's value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError<E> {
    /// The caller's context finished first.
    #[error("{0}")]
    Canceled(ContextError),

    /// The batcher no longer accepts items.
    #[error("batcher: shut down")]
    Shutdown,

    /// No Tokio runtime was available to run the batch handler.
    #[error("batcher: no Tokio runtime to run the handler on")]
    NoRuntime,

    /// The batch handler went away without producing a result.
    #[error("batcher: handler exited without a result")]
    Abandoned,

    /// The batch handler failed; every item of the batch sees this error.
    #[error("{0}")]
    Handler(E),
}

struct Waiter<I, O, E> {
    id: u64,
    item: I,
    tx: oneshot::Sender<Result<O, E>>,
}

struct State<I, O, E> {
    pending: VecDeque<Waiter<I, O, E>>,
    handlers: usize,
    closed: bool,
    next_id: u64,
}

struct Inner<I, O, E> {
    opts: BatcherOptions,
    // Runtime the batcher was built on; workers are spawned there even when
    // items arrive from threads outside any runtime.
    runtime: Option<Handle>,
    handler: Box<HandlerFn<I, O, E>>,
    state: Mutex<State<I, O, E>>,
    idle: Notify,
}

/// Groups concurrent requests into batch handler calls.
///
/// `.clone()` is cheap; clones share the same queue and worker pool.
pub struct Batcher<I, O, E> {
    inner: Arc<Inner<I, O, E>>,
}

impl<I, O, E> Clone for Batcher<I, O, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, O, E> Batcher<I, O, E>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a batcher that dispatches batches to `handler`.
    ///
    /// Workers are spawned when items arrive, on the Tokio runtime current at
    /// construction (or, if there was none, the one current when the item is
    /// added). Construction itself does not spawn anything.
    pub fn new<F, Fut>(opts: BatcherOptions, handler: F) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        // ---
        let handler: Box<HandlerFn<I, O, E>> = Box::new(move |items| Box::pin(handler(items)));

        Self {
            inner: Arc::new(Inner {
                opts,
                runtime: Handle::try_current().ok(),
                handler,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    handlers: 0,
                    closed: false,
                    next_id: 0,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// The limits this batcher runs with.
    pub fn options(&self) -> BatcherOptions {
        self.inner.opts
    }

    /// Add an item and wait for the outcome of the batch it lands in.
    ///
    /// Returns [`BatchError::Canceled`] as soon as `ctx` is done, whether or
    /// not the item was already dispatched.
    pub async fn add(&self, ctx: &Context, item: I) -> Result<O, BatchError<E>> {
        // ---
        if let Some(err) = ctx.err() {
            return Err(BatchError::Canceled(err));
        }

        let (id, mut rx) = self.enqueue(item)?;

        tokio::select! {
            biased;
            res = &mut rx => resolve(res),
            err = ctx.done() => {
                if self.remove_pending(id) {
                    crate::log_debug!("batcher: removed canceled item {id} before dispatch");
                }
                Err(BatchError::Canceled(err))
            }
        }
    }

    /// Add an item without waiting for it to be handled.
    ///
    /// The returned receiver resolves with the batch outcome; dropping it is
    /// fine when the caller does not care. May be called from any thread.
    ///
    /// # Errors
    ///
    /// [`BatchError::Shutdown`] after [`close`](Self::close);
    /// [`BatchError::NoRuntime`] if a worker is needed but no Tokio runtime
    /// is reachable.
    pub fn add_no_wait(&self, item: I) -> Result<Completion<O, E>, BatchError<E>> {
        // ---
        self.enqueue(item).map(|(_, rx)| rx)
    }

    /// Stop accepting new items. Already queued items are still dispatched.
    pub fn close(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.inner.state);
        state.closed = true;
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.inner.state).closed
    }

    /// Wait until no batch handler is running.
    ///
    /// After [`close`](Self::close), this means every accepted item has been
    /// resolved.
    pub async fn drained(&self) {
        // ---
        loop {
            let notified = self.inner.idle.notified();
            {
                let mut state = lock_ignore_poison(&self.inner.state);
                if state.handlers == 0 {
                    // Only reachable with a non-empty queue after a handler
                    // panic; dropping the waiters resolves them as abandoned.
                    state.pending.clear();
                    return;
                }
            }
            notified.await;
        }
    }

    /// [`close`](Self::close), then wait until [`drained`](Self::drained).
    pub async fn shutdown(&self) {
        // ---
        self.close();
        self.drained().await;
    }

    fn enqueue(&self, item: I) -> Result<(u64, Completion<O, E>), BatchError<E>> {
        // ---
        let mut state = lock_ignore_poison(&self.inner.state);
        if state.closed {
            return Err(BatchError::Shutdown);
        }

        // A free handler slot means this item starts a worker right away.
        let runtime = if state.handlers < self.inner.opts.effective_handlers() {
            let runtime = self
                .inner
                .runtime
                .clone()
                .or_else(|| Handle::try_current().ok());
            match runtime {
                Some(runtime) => Some(runtime),
                None => return Err(BatchError::NoRuntime),
            }
        } else {
            None
        };

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = oneshot::channel();
        state.pending.push_back(Waiter { id, item, tx });

        if let Some(runtime) = runtime {
            if let Some(batch) = self.inner.next_batch(&mut state) {
                state.handlers += 1;
                runtime.spawn(run_worker(self.inner.clone(), batch));
            }
        }

        Ok((id, rx))
    }

    fn remove_pending(&self, id: u64) -> bool {
        // ---
        let mut state = lock_ignore_poison(&self.inner.state);
        match state.pending.iter().position(|w| w.id == id) {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }
}

impl<I, O, E> Inner<I, O, E> {
    fn next_batch(&self, state: &mut State<I, O, E>) -> Option<Vec<Waiter<I, O, E>>> {
        // ---
        if state.pending.is_empty() {
            return None;
        }
        let len = state.pending.len();
        let n = match self.opts.max_batch_size {
            0 => len,
            max => max.min(len),
        };
        Some(state.pending.drain(..n).collect())
    }
}

fn resolve<O, E>(
    res: Result<Result<O, E>, oneshot::error::RecvError>,
) -> Result<O, BatchError<E>> {
    // ---
    match res {
        Ok(outcome) => outcome.map_err(BatchError::Handler),
        Err(_) => Err(BatchError::Abandoned),
    }
}

/// Releases the worker's handler slot if the worker unwinds.
struct WorkerSlot<I, O, E> {
    inner: Arc<Inner<I, O, E>>,
    released: bool,
}

impl<I, O, E> Drop for WorkerSlot<I, O, E> {
    fn drop(&mut self) {
        // ---
        if self.released {
            return;
        }
        crate::log_error!("batcher: handler task exited abnormally");
        let mut state = lock_ignore_poison(&self.inner.state);
        state.handlers -= 1;
        if state.handlers == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

async fn run_worker<I, O, E>(inner: Arc<Inner<I, O, E>>, mut batch: Vec<Waiter<I, O, E>>)
where
    O: Clone,
    E: Clone,
{
    // ---
    let mut slot = WorkerSlot {
        inner: inner.clone(),
        released: false,
    };

    loop {
        let mut items = Vec::with_capacity(batch.len());
        let mut slots = Vec::with_capacity(batch.len());
        for waiter in batch {
            items.push(waiter.item);
            slots.push(waiter.tx);
        }

        let outcome = (inner.handler)(items).await;

        for tx in slots {
            // A closed receiver means the caller gave up; nothing to do.
            let _ = tx.send(outcome.clone());
        }

        {
            let mut state = lock_ignore_poison(&inner.state);
            match inner.next_batch(&mut state) {
                Some(next) => batch = next,
                None => {
                    state.handlers -= 1;
                    slot.released = true;
                    if state.handlers == 0 {
                        inner.idle.notify_waiters();
                    }
                    return;
                }
            }
        }
    }
}
