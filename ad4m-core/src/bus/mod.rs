//! Process-wide change notification.
//!
//! The bus is created at startup and handed to every component that
//! publishes. Each subscriber owns a bounded queue; `publish` only ever
//! does a non-blocking send into it. A subscriber whose queue is full is
//! disconnected on the spot and sees a single
//! [`CoreError::SubscriberOverflow`] after draining what it had.

mod subscription;

pub use subscription::{Subscription, SubscriptionId};

use crate::error::CoreError;
use ad4m_types::{ChangeEvent, Topic};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

type Predicate = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Per-subscription predicate evaluated before delivery.
#[derive(Clone)]
pub enum EventFilter {
    All,
    /// Only events concerning this perspective
    Perspective(Uuid),
    Custom(Predicate),
}

impl EventFilter {
    pub fn custom(predicate: impl Fn(&ChangeEvent) -> bool + Send + Sync + 'static) -> Self {
        EventFilter::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Perspective(uuid) => event.perspective_uuid() == Some(*uuid),
            EventFilter::Custom(predicate) => predicate(event),
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::All => f.write_str("All"),
            EventFilter::Perspective(uuid) => f.debug_tuple("Perspective").field(uuid).finish(),
            EventFilter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

struct Subscriber {
    topic: Topic,
    filter: EventFilter,
    sender: mpsc::Sender<ChangeEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusState {
    closed: bool,
    subscribers: HashMap<SubscriptionId, Subscriber>,
}

pub(crate) struct BusShared {
    capacity: usize,
    next_id: AtomicU64,
    state: Mutex<BusState>,
}

impl BusShared {
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        self.state.lock().subscribers.remove(&id).is_some()
    }
}

/// Cloneable handle to one change bus.
#[derive(Clone)]
pub struct ChangeBus {
    shared: Arc<BusShared>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(BusShared {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Register for `topic`, delivering only events accepted by `filter`.
    ///
    /// On a closed bus the returned stream is already finished.
    pub fn subscribe(&self, topic: Topic, filter: EventFilter) -> Subscription {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::channel(self.shared.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut state = self.shared.state.lock();
        if state.closed {
            debug!(%id, %topic, "subscribe on closed bus");
        } else {
            state.subscribers.insert(
                id,
                Subscriber {
                    topic,
                    filter,
                    sender,
                    overflowed: overflowed.clone(),
                },
            );
            debug!(%id, %topic, "subscribed");
        }
        drop(state);

        Subscription::new(id, topic, receiver, overflowed, Arc::downgrade(&self.shared))
    }

    /// Deliver `event` to every matching subscriber. Never blocks.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let topic = event.topic();
        let mut state = self.shared.state.lock();
        if state.closed {
            return 0;
        }

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, subscriber) in state.subscribers.iter() {
            if subscriber.topic != topic || !subscriber.filter.matches(&event) {
                continue;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%id, %topic, "subscriber queue full, disconnecting");
                    subscriber.overflowed.store(true, Ordering::SeqCst);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        // Dropping the sender ends the stream once its backlog drains.
        for id in dropped {
            state.subscribers.remove(&id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// End every subscription and refuse new ones.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        let count = state.subscribers.len();
        state.subscribers.clear();
        debug!(subscribers = count, "change bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}
