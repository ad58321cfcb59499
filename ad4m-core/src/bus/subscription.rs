use super::BusShared;
use crate::error::CoreError;
use ad4m_types::{ChangeEvent, Topic};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Subscription identifier, unique per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// Stream of events for one topic.
///
/// Yields `Ok(event)` in publish order. After an overflow it yields one
/// `Err(SubscriberOverflow)` and then ends. Dropping the subscription
/// unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    receiver: mpsc::Receiver<ChangeEvent>,
    overflowed: Arc<AtomicBool>,
    overflow_reported: bool,
    bus: Weak<BusShared>,
}

impl Subscription {
    pub(super) fn new(
        id: SubscriptionId,
        topic: Topic,
        receiver: mpsc::Receiver<ChangeEvent>,
        overflowed: Arc<AtomicBool>,
        bus: Weak<BusShared>,
    ) -> Self {
        Self {
            id,
            topic,
            receiver,
            overflowed,
            overflow_reported: false,
            bus,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Stop receiving future events. Calling it again does nothing.
    ///
    /// Events already queued can still be read.
    pub fn unsubscribe(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.id) {
                debug!(id = %self.id, topic = %self.topic, "unsubscribed");
            }
        }
        self.bus = Weak::new();
        self.receiver.close();
    }
}

impl Stream for Subscription {
    type Item = Result<ChangeEvent, CoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                if self.overflowed.load(Ordering::SeqCst) && !self.overflow_reported {
                    self.overflow_reported = true;
                    Poll::Ready(Some(Err(CoreError::SubscriberOverflow)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}
