//! Topic-based publish/subscribe bus
//!
//! Each subscription owns a bounded channel. A publisher clones the senders
//! registered for the message kind under the topic lock, releases the lock
//! and then delivers, waiting whenever a subscriber's buffer is full.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::trace;

use super::kind::Kind;

/// Messages buffered per subscriber before publishers have to wait
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 512;

/// One announcement on the bus
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_obj: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_obj: Option<Value>,
}

impl Message {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            old_obj: None,
            new_obj: None,
        }
    }

    pub fn with_old(mut self, obj: Value) -> Self {
        self.old_obj = Some(obj);
        self
    }

    pub fn with_new(mut self, obj: Value) -> Self {
        self.new_obj = Some(obj);
        self
    }
}

/// Registered subscriptions, per topic
#[derive(Default)]
struct Topics {
    next_id: u64,
    by_kind: HashMap<Kind, BTreeMap<u64, mpsc::Sender<Message>>>,
}

impl Topics {
    /// Drop every sender registered for `id`; returns whether any was found
    fn remove(&mut self, id: u64) -> bool {
        let mut found = false;
        self.by_kind.retain(|_, subscribers| {
            found |= subscribers.remove(&id).is_some();
            !subscribers.is_empty()
        });
        found
    }
}

struct Shared {
    topics: Mutex<Topics>,
    capacity: usize,
}

impl Shared {
    fn topics(&self) -> MutexGuard<'_, Topics> {
        // The table stays consistent even if a holder panicked
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a publish/subscribe bus. Clones share the same topics.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Bus whose subscribers buffer at most `capacity` messages (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics: Mutex::new(Topics::default()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Process-wide bus shared by every component that does not get one injected
    pub fn global() -> &'static EventBus {
        static BUS: OnceLock<EventBus> = OnceLock::new();
        BUS.get_or_init(EventBus::new)
    }

    /// Receive every message published from now on for any of `kinds`
    pub fn subscribe(&self, kinds: &[Kind]) -> Subscription {
        let kinds: BTreeSet<Kind> = kinds.iter().copied().collect();
        let (tx, rx) = mpsc::channel(self.shared.capacity);

        let id = {
            let mut topics = self.shared.topics();
            let id = topics.next_id;
            topics.next_id += 1;
            for kind in &kinds {
                topics
                    .by_kind
                    .entry(*kind)
                    .or_default()
                    .insert(id, tx.clone());
            }
            id
        };

        trace!(subscription = id, kinds = ?kinds, "Subscribed");

        Subscription {
            id,
            kinds: kinds.into_iter().collect(),
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Deliver `message` to every subscriber of its kind.
    ///
    /// Waits while a subscriber's buffer is full. Subscribers that go away
    /// mid-delivery are skipped.
    pub async fn publish(&self, message: Message) {
        let senders: Vec<(u64, mpsc::Sender<Message>)> = {
            let topics = self.shared.topics();
            topics
                .by_kind
                .get(&message.kind)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .map(|(id, tx)| (*id, tx.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        if senders.is_empty() {
            trace!(kind = %message.kind, "No subscribers");
            return;
        }

        for (id, tx) in senders {
            if tx.send(message.clone()).await.is_err() {
                trace!(kind = %message.kind, subscription = id, "Subscriber closed during publish");
            }
        }
    }

    /// Remove a subscription from every topic and close its channel.
    ///
    /// On return no publisher can write to the subscription and none is left
    /// waiting on it. Buffered messages are discarded.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        let mut subscription = subscription;
        let removed = subscription.shared.topics().remove(subscription.id);

        // Publishers may still hold a cloned sender; closing the receiver
        // fails their pending sends, and draining until `None` waits out any
        // send that already reserved a slot.
        subscription.rx.close();
        let mut drained = 0usize;
        while subscription.rx.recv().await.is_some() {
            drained += 1;
        }

        trace!(
            subscription = subscription.id,
            removed,
            drained,
            "Unsubscribed"
        );
    }

    /// Number of subscriptions registered for `kind`
    pub fn subscriber_count(&self, kind: Kind) -> usize {
        self.shared
            .topics()
            .by_kind
            .get(&kind)
            .map_or(0, BTreeMap::len)
    }
}

/// Receiving end of a bus subscription.
///
/// Dropping it deregisters it from every topic.
pub struct Subscription {
    id: u64,
    kinds: Vec<Kind>,
    rx: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Wait for the next message; `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Message, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.shared.topics().remove(self.id) {
            trace!(subscription = self.id, "Subscription dropped");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .finish()
    }
}
