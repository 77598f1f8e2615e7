// src/driver/memory/subscription.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::{MemoryError, MemoryTopic};
use crate::domain::{
    // ---
    AckId,
    BoxError,
    DriverError,
    Envelope,
    NativeError,
    NativeRef,
    SubscriptionDriver,
};
use crate::lock::lock_ignore_poison;
use crate::{Context, ErrorCode};

/// Outstanding delivery record for one message.
struct Record {
    envelope: Envelope,
    // `None` until first delivered, and again after a nack.
    deadline: Option<Instant>,
    acked: bool,
    ack_ids: Vec<u64>,
}

impl Record {
    fn is_due(&self, now: Instant) -> bool {
        // ---
        if self.acked {
            return false;
        }
        match self.deadline {
            None => true,
            Some(deadline) => deadline <= now,
        }
    }
}

#[derive(Default)]
struct Records {
    // Keyed by publish sequence; iteration order is publish order.
    by_seq: BTreeMap<u64, Record>,
    by_ack: HashMap<u64, u64>,
    next_seq: u64,
    next_ack: u64,
    closed: bool,
}

impl Records {
    fn remove(&mut self, seq: u64) {
        // ---
        if let Some(record) = self.by_seq.remove(&seq) {
            for id in record.ack_ids {
                self.by_ack.remove(&id);
            }
        }
    }
}

/// State shared between a subscription and the topic feeding it.
pub(super) struct SubscriptionState {
    ack_deadline: Duration,
    records: Mutex<Records>,
    published: Notify,
}

impl SubscriptionState {
    pub(super) fn publish(&self, batch: &[Envelope]) {
        // ---
        {
            let mut records = lock_ignore_poison(&self.records);
            if records.closed {
                return;
            }
            for envelope in batch {
                let seq = records.next_seq;
                records.next_seq += 1;
                records.by_seq.insert(
                    seq,
                    Record {
                        envelope: envelope.clone(),
                        deadline: None,
                        acked: false,
                        ack_ids: Vec::new(),
                    },
                );
            }
        }
        self.published.notify_waiters();
    }
}

/// In-memory subscription driver with ack-deadline redelivery.
///
/// `.clone()` is cheap; clones are the same subscription.
#[derive(Clone)]
pub struct MemorySubscription {
    topic: MemoryTopic,
    state: Arc<SubscriptionState>,
}

impl MemorySubscription {
    /// Attach a new subscription to `topic`.
    ///
    /// Only messages sent after this call are delivered to it. A delivered
    /// message that is not acked within `ack_deadline` becomes eligible for
    /// redelivery.
    pub fn new(topic: &MemoryTopic, ack_deadline: Duration) -> Self {
        // ---
        let state = Arc::new(SubscriptionState {
            ack_deadline,
            records: Mutex::new(Records::default()),
            published: Notify::new(),
        });
        topic.attach(&state);

        crate::log_debug!(
            "memory: subscription attached to {:?} (ack deadline {:?})",
            topic.name(),
            ack_deadline
        );

        Self {
            topic: topic.clone(),
            state,
        }
    }

    /// The ack deadline this subscription was created with.
    pub fn ack_deadline(&self) -> Duration {
        self.state.ack_deadline
    }

    /// Number of messages that are not yet acked.
    pub fn outstanding(&self) -> usize {
        // ---
        lock_ignore_poison(&self.state.records)
            .by_seq
            .values()
            .filter(|record| !record.acked)
            .count()
    }

    /// Select up to `max_messages` messages that are due at `now`.
    ///
    /// Scans in publish order and picks messages that are not acked and were
    /// either never delivered or whose delivery deadline is `<= now`. Each
    /// selected message is stamped with a new [`AckId`] and a deadline of
    /// `now + ack_deadline`; the returned envelopes are copies.
    pub fn select_due(&self, now: Instant, max_messages: usize) -> Vec<Envelope> {
        // ---
        let mut records = lock_ignore_poison(&self.state.records);
        let records = &mut *records;

        let acked: Vec<u64> = records
            .by_seq
            .iter()
            .filter(|(_, record)| record.acked)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in acked {
            records.remove(seq);
        }

        let mut due = Vec::new();
        for (seq, record) in records.by_seq.iter_mut() {
            if due.len() >= max_messages {
                break;
            }
            if !record.is_due(now) {
                continue;
            }

            let ack_id = records.next_ack;
            records.next_ack += 1;
            records.by_ack.insert(ack_id, *seq);

            record.ack_ids.push(ack_id);
            record.deadline = Some(now + self.state.ack_deadline);

            let mut envelope = record.envelope.clone();
            envelope.ack_id = Some(AckId::Seq(ack_id));
            due.push(envelope);
        }
        due
    }

    /// Earliest pending redelivery deadline, if any.
    fn next_deadline(&self) -> Option<Instant> {
        // ---
        lock_ignore_poison(&self.state.records)
            .by_seq
            .values()
            .filter(|record| !record.acked)
            .filter_map(|record| record.deadline)
            .min()
    }

    fn ensure_open(&self) -> Result<(), BoxError> {
        // ---
        if lock_ignore_poison(&self.state.records).closed {
            return Err(Box::new(MemoryError::SubscriptionClosed));
        }
        Ok(())
    }

    /// Apply `f` to the record of every known ack id.
    fn settle(&self, ack_ids: &[AckId], f: impl Fn(&mut Record)) -> Result<(), BoxError> {
        // ---
        let mut records = lock_ignore_poison(&self.state.records);
        if records.closed {
            return Err(Box::new(MemoryError::SubscriptionClosed));
        }
        let records = &mut *records;

        for ack_id in ack_ids {
            // Tokens never come from this driver; unknown ids are ignored.
            let AckId::Seq(id) = ack_id else {
                continue;
            };
            let Some(seq) = records.by_ack.get(id) else {
                continue;
            };
            if let Some(record) = records.by_seq.get_mut(seq) {
                f(record);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SubscriptionDriver for MemorySubscription {
    // ---
    async fn receive_batch(
        &self,
        ctx: &Context,
        max_messages: usize,
    ) -> Result<Vec<Envelope>, BoxError> {
        // ---
        if max_messages == 0 {
            self.ensure_open()?;
            return Ok(Vec::new());
        }

        loop {
            // Registered before checking so a concurrent publish is not missed.
            let published = self.state.published.notified();

            self.ensure_open()?;
            let due = self.select_due(Instant::now(), max_messages);
            if !due.is_empty() {
                return Ok(due);
            }

            let redelivery = async {
                match self.next_deadline() {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = published => {}
                _ = redelivery => {}
                err = ctx.done() => return Err(Box::new(err)),
            }
        }
    }

    async fn send_acks(&self, _ctx: &Context, ack_ids: &[AckId]) -> Result<(), BoxError> {
        // ---
        self.settle(ack_ids, |record| record.acked = true)
    }

    async fn send_nacks(&self, _ctx: &Context, ack_ids: &[AckId]) -> Result<(), BoxError> {
        // ---
        self.settle(ack_ids, |record| {
            if !record.acked {
                record.deadline = None;
            }
        })?;
        self.state.published.notify_waiters();
        Ok(())
    }

    fn can_nack(&self) -> bool {
        true
    }

    fn is_retryable(&self, _err: &DriverError) -> bool {
        false
    }

    fn error_code(&self, err: &DriverError) -> ErrorCode {
        super::error_code(err)
    }

    async fn close(&self) -> Result<(), BoxError> {
        // ---
        {
            let mut records = lock_ignore_poison(&self.state.records);
            records.closed = true;
            records.by_seq.clear();
            records.by_ack.clear();
        }
        self.topic.detach(&self.state);
        self.state.published.notify_waiters();

        crate::log_debug!("memory: subscription to {:?} closed", self.topic.name());
        Ok(())
    }

    fn as_native(&self) -> Option<NativeRef<'_>> {
        Some(NativeRef::MemorySubscription(self))
    }

    fn error_as<'e>(&self, err: &'e DriverError) -> Option<NativeError<'e>> {
        err.downcast_ref::<MemoryError>().map(NativeError::Memory)
    }
}

impl std::fmt::Debug for MemorySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubscription")
            .field("topic", &self.topic.name())
            .field("ack_deadline", &self.state.ack_deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::TopicDriver;
    use bytes::Bytes;

    fn envelope(body: &'static str) -> Envelope {
        Envelope::new(Bytes::from_static(body.as_bytes()), HashMap::new())
    }

    fn bodies(envs: &[Envelope]) -> Vec<&[u8]> {
        envs.iter().map(|e| e.body.as_ref()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_messages_returns_immediately() {
        // ---
        let topic = MemoryTopic::new("t");
        let sub = MemorySubscription::new(&topic, Duration::from_millis(10));
        let ctx = Context::background();

        topic.send_batch(&ctx, &[envelope("a")]).await.unwrap();
        assert_eq!(sub.select_due(Instant::now(), 1).len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The record is overdue but nothing may be selected.
        let batch = tokio::time::timeout(Duration::from_secs(1), sub.receive_batch(&ctx, 0))
            .await
            .expect("receive_batch with max 0 did not return")
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(sub.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_ack_deadline() {
        // ---
        let topic = MemoryTopic::new("t");
        let sub = MemorySubscription::new(&topic, Duration::from_secs(60));
        let ctx = Context::background();

        topic
            .send_batch(&ctx, &[envelope("a"), envelope("b"), envelope("c")])
            .await
            .unwrap();

        let now = Instant::now();
        let first = sub.select_due(now, 2);
        assert_eq!(bodies(&first), vec![b"a".as_ref(), b"b"]);

        let second = sub.select_due(now, 2);
        assert_eq!(bodies(&second), vec![b"c".as_ref()]);

        assert!(sub.select_due(now, 10).is_empty());

        let later = now + Duration::from_secs(3600);
        let redelivered = sub.select_due(later, 10);
        assert_eq!(bodies(&redelivered), vec![b"a".as_ref(), b"b", b"c"]);

        // Redelivery carries new delivery handles.
        assert_ne!(redelivered[0].ack_id, first[0].ack_id);

        let ids: Vec<AckId> = redelivered.iter().filter_map(|e| e.ack_id.clone()).collect();
        sub.send_acks(&ctx, &ids).await.unwrap();

        let much_later = later + Duration::from_secs(3600);
        assert!(sub.select_due(much_later, 10).is_empty());
        assert_eq!(sub.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_ack_unknown_or_repeated_is_noop() {
        // ---
        let topic = MemoryTopic::new("t");
        let sub = MemorySubscription::new(&topic, Duration::from_secs(60));
        let ctx = Context::background();

        topic.send_batch(&ctx, &[envelope("a")]).await.unwrap();
        let due = sub.select_due(Instant::now(), 1);
        let id = due[0].ack_id.clone().unwrap();

        sub.send_acks(&ctx, &[id.clone()]).await.unwrap();
        sub.send_acks(&ctx, &[id]).await.unwrap();
        sub.send_acks(&ctx, &[AckId::Seq(999), AckId::Token(Bytes::from_static(b"x"))])
            .await
            .unwrap();

        assert_eq!(sub.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_nack_makes_message_due_immediately() {
        // ---
        let topic = MemoryTopic::new("t");
        let sub = MemorySubscription::new(&topic, Duration::from_secs(3600));
        let ctx = Context::background();

        topic.send_batch(&ctx, &[envelope("a")]).await.unwrap();
        let now = Instant::now();
        let due = sub.select_due(now, 1);
        assert!(sub.select_due(now, 1).is_empty());

        let id = due[0].ack_id.clone().unwrap();
        sub.send_nacks(&ctx, &[id]).await.unwrap();

        assert_eq!(bodies(&sub.select_due(now, 1)), vec![b"a".as_ref()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_batch_waits_for_publish() {
        // ---
        let topic = MemoryTopic::new("t");
        let sub = MemorySubscription::new(&topic, Duration::from_secs(60));

        let receiver = tokio::spawn({
            let sub = sub.clone();
            async move { sub.receive_batch(&Context::background(), 10).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!receiver.is_finished());

        topic
            .send_batch(&Context::background(), &[envelope("a")])
            .await
            .unwrap();

        let got = receiver.await.unwrap().unwrap();
        assert_eq!(bodies(&got), vec![b"a".as_ref()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_batch_honors_context() {
        // ---
        let topic = MemoryTopic::new("t");
        let sub = MemorySubscription::new(&topic, Duration::from_secs(60));

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = sub.receive_batch(&ctx, 10).await.unwrap_err();

        assert_eq!(sub.error_code(&*err), ErrorCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_close_detaches_from_topic() {
        // ---
        let topic = MemoryTopic::new("t");
        let sub = MemorySubscription::new(&topic, Duration::from_secs(60));
        assert_eq!(topic.subscription_count(), 1);

        sub.close().await.unwrap();
        assert_eq!(topic.subscription_count(), 0);

        let err = sub
            .receive_batch(&Context::background(), 1)
            .await
            .unwrap_err();
        assert_eq!(sub.error_code(&*err), ErrorCode::FailedPrecondition);
        assert!(matches!(
            sub.error_as(&*err),
            Some(NativeError::Memory(MemoryError::SubscriptionClosed))
        ));
    }
}
