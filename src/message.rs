// src/message.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::domain::{AckId, Envelope};
use crate::{Batcher, Error, ErrorCode, Result};

/// Acknowledgement queued on a subscription's ack batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckRequest {
    Ack(AckId),
    Nack(AckId),
}

pub(crate) type AckBatcher = Batcher<AckRequest, (), Error>;

struct Delivery {
    ack_id: AckId,
    acks: AckBatcher,
    can_nack: bool,
    done: AtomicBool,
}

/// A message sent to a [`Topic`](crate::Topic) or received from a
/// [`Subscription`](crate::Subscription).
///
/// Body and metadata are plain owned values: changing them on a received
/// message has no effect on the subscription. Clones of a received message
/// share its delivery, so acknowledging any clone acknowledges them all.
#[derive(Clone, Default)]
pub struct Message {
    /// Opaque payload.
    pub body: Bytes,

    /// Application metadata.
    pub metadata: HashMap<String, String>,

    loggable_id: Option<String>,
    delivery: Option<Arc<Delivery>>,
}

impl Message {
    /// Create a message with the given body and no metadata.
    pub fn new(body: impl Into<Bytes>) -> Self {
        // ---
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Add a metadata entry, replacing any previous value for `key`.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Diagnostic identifier assigned by the driver, if any.
    pub fn loggable_id(&self) -> Option<&str> {
        self.loggable_id.as_deref()
    }

    /// Delivery handle of a received message.
    pub fn ack_id(&self) -> Option<&AckId> {
        self.delivery.as_ref().map(|d| &d.ack_id)
    }

    /// Acknowledge the message.
    ///
    /// Does not block: the acknowledgement is queued and sent to the driver
    /// in the background. Acknowledging a message more than once, or after
    /// [`nack`](Self::nack), does nothing. Ack failures surface as the
    /// subscription's error on a later `receive`.
    pub fn ack(&self) {
        // ---
        let Some(delivery) = &self.delivery else {
            crate::log_warn!("pubsub: ack on a message that was not received; ignoring");
            return;
        };
        delivery.settle(AckRequest::Ack(delivery.ack_id.clone()));
    }

    /// Negatively acknowledge the message, making it eligible for
    /// redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::FailedPrecondition`] if the message was not
    /// received from a subscription, or if the subscription's driver cannot
    /// nack. Calling `nack` after an ack or nack does nothing.
    pub fn nack(&self) -> Result<()> {
        // ---
        let Some(delivery) = &self.delivery else {
            return Err(Error::new(
                ErrorCode::FailedPrecondition,
                None,
                "pubsub: nack on a message that was not received",
            ));
        };
        if !delivery.can_nack {
            return Err(Error::new(
                ErrorCode::FailedPrecondition,
                None,
                "pubsub: driver does not support nack",
            ));
        }
        delivery.settle(AckRequest::Nack(delivery.ack_id.clone()));
        Ok(())
    }

    pub(crate) fn received(envelope: Envelope, acks: &AckBatcher, can_nack: bool) -> Self {
        // ---
        let delivery = envelope.ack_id.map(|ack_id| {
            Arc::new(Delivery {
                ack_id,
                acks: acks.clone(),
                can_nack,
                done: AtomicBool::new(false),
            })
        });

        Self {
            body: envelope.body,
            metadata: envelope.metadata,
            loggable_id: envelope.loggable_id,
            delivery,
        }
    }

    pub(crate) fn into_envelope(self) -> Envelope {
        // ---
        Envelope {
            body: self.body,
            metadata: self.metadata,
            ack_id: None,
            loggable_id: self.loggable_id,
        }
    }
}

impl Delivery {
    fn settle(&self, request: AckRequest) {
        // ---
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.acks.add_no_wait(request) {
            crate::log_warn!(
                "pubsub: dropping acknowledgement for {:?}: {err}",
                self.ack_id
            );
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("metadata", &self.metadata)
            .field("loggable_id", &self.loggable_id)
            .field("ack_id", &self.ack_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::BatcherOptions;
    use std::sync::Mutex;

    fn recording_batcher() -> (AckBatcher, Arc<Mutex<Vec<AckRequest>>>) {
        // ---
        let seen = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new(BatcherOptions::default(), {
            let seen = seen.clone();
            move |items: Vec<AckRequest>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().extend(items);
                    Ok(())
                }
            }
        });
        (batcher, seen)
    }

    fn delivered(acks: &AckBatcher, can_nack: bool) -> Message {
        // ---
        let envelope = Envelope {
            body: Bytes::from_static(b"hello"),
            ack_id: Some(AckId::Seq(7)),
            ..Envelope::default()
        };
        Message::received(envelope, acks, can_nack)
    }

    #[tokio::test]
    async fn test_ack_is_sent_once() {
        // ---
        let (acks, seen) = recording_batcher();
        let msg = delivered(&acks, true);

        msg.ack();
        msg.ack();
        msg.clone().ack();
        msg.nack().unwrap();

        acks.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec![AckRequest::Ack(AckId::Seq(7))]);
    }

    #[tokio::test]
    async fn test_nack_requires_driver_support() {
        // ---
        let (acks, seen) = recording_batcher();
        let msg = delivered(&acks, false);

        let err = msg.nack().unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        // Still ackable after the rejected nack.
        msg.ack();
        acks.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec![AckRequest::Ack(AckId::Seq(7))]);
    }

    #[test]
    fn test_unreceived_message_cannot_be_nacked() {
        // ---
        let msg = Message::new("x").with_metadata("k", "v");
        assert_eq!(msg.ack_id(), None);
        assert_eq!(
            msg.nack().unwrap_err().code(),
            ErrorCode::FailedPrecondition
        );
        // Ack on a message that was never received is ignored.
        msg.ack();
    }

    #[test]
    fn test_received_copy_is_independent() {
        // ---
        let (acks, _seen) = recording_batcher();
        let msg = delivered(&acks, true);

        let mut copy = msg.clone();
        copy.body = Bytes::from_static(b"changed");
        copy.metadata.insert("k".into(), "v".into());

        assert_eq!(msg.body, Bytes::from_static(b"hello"));
        assert!(msg.metadata.is_empty());
    }
}
