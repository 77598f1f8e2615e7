// src/driver/memory/topic.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::subscription::SubscriptionState;
use super::MemoryError;
use crate::domain::{BoxError, DriverError, Envelope, NativeError, NativeRef, TopicDriver};
use crate::lock::lock_ignore_poison;
use crate::{Context, ErrorCode};

/// In-memory topic driver.
///
/// Fans every sent message out to the subscriptions attached to it at send
/// time. `.clone()` is cheap; clones are the same topic.
#[derive(Clone)]
pub struct MemoryTopic {
    inner: Arc<TopicState>,
}

struct TopicState {
    name: String,
    subscriptions: Mutex<Vec<Weak<SubscriptionState>>>,
    closed: AtomicBool,
    sent: AtomicU64,
}

impl MemoryTopic {
    /// Create a topic with no subscriptions.
    pub fn new(name: impl Into<String>) -> Self {
        // ---
        Self {
            inner: Arc::new(TopicState {
                name: name.into(),
                subscriptions: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                sent: AtomicU64::new(0),
            }),
        }
    }

    /// Topic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of live subscriptions attached to the topic.
    pub fn subscription_count(&self) -> usize {
        // ---
        let mut subs = lock_ignore_poison(&self.inner.subscriptions);
        subs.retain(|sub| sub.strong_count() > 0);
        subs.len()
    }

    /// Whether [`close`](TopicDriver::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(super) fn attach(&self, sub: &Arc<SubscriptionState>) {
        // ---
        lock_ignore_poison(&self.inner.subscriptions).push(Arc::downgrade(sub));
    }

    pub(super) fn detach(&self, sub: &Arc<SubscriptionState>) {
        // ---
        let target = Arc::downgrade(sub);
        lock_ignore_poison(&self.inner.subscriptions)
            .retain(|s| s.strong_count() > 0 && !s.ptr_eq(&target));
    }
}

#[async_trait::async_trait]
impl TopicDriver for MemoryTopic {
    // ---
    async fn send_batch(&self, ctx: &Context, msgs: &[Envelope]) -> Result<(), BoxError> {
        // ---
        if self.is_closed() {
            return Err(Box::new(MemoryError::TopicClosed(self.inner.name.clone())));
        }
        if let Some(err) = ctx.err() {
            return Err(Box::new(err));
        }

        // Loggable ids are assigned per topic, in publish order.
        let first = self.inner.sent.fetch_add(msgs.len() as u64, Ordering::Relaxed);
        let batch: Vec<Envelope> = msgs
            .iter()
            .zip(first..)
            .map(|(msg, n)| Envelope {
                body: msg.body.clone(),
                metadata: msg.metadata.clone(),
                ack_id: None,
                loggable_id: Some(format!("{}/{n}", self.inner.name)),
            })
            .collect();

        let subs: Vec<Arc<SubscriptionState>> = lock_ignore_poison(&self.inner.subscriptions)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        if subs.is_empty() {
            crate::log_warn!(
                "memory: topic {:?} has no subscriptions; dropping {} message(s)",
                self.inner.name,
                batch.len()
            );
            return Ok(());
        }

        for sub in subs {
            sub.publish(&batch);
        }
        Ok(())
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        false
    }

    fn error_code(&self, err: &DriverError) -> ErrorCode {
        super::error_code(err)
    }

    async fn close(&self) -> Result<(), BoxError> {
        // ---
        crate::log_debug!("memory: closing topic {:?}", self.inner.name);
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn as_native(&self) -> Option<NativeRef<'_>> {
        Some(NativeRef::MemoryTopic(self))
    }

    fn error_as<'e>(&self, err: &'e DriverError) -> Option<NativeError<'e>> {
        err.downcast_ref::<MemoryError>().map(NativeError::Memory)
    }
}

impl std::fmt::Debug for MemoryTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTopic")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
