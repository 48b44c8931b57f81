// Event bus - lifecycle notifications delivered synchronously to observers

use crate::document::{Document, Fields};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Write,
    Delete,
    Query,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A document was assembled and validated (not yet persisted)
    Create { collection: String, document: Document },
    /// A document and its index entries were persisted
    Write { collection: String, document: Document },
    /// A document and its index entries were removed
    Delete { collection: String, document: Document },
    /// A `find_one`/`find_all` finished; `results` is the full result set
    Query {
        collection: String,
        query: Fields,
        results: Vec<Document>,
    },
    /// The database was closed
    Close { database: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Create { .. } => EventKind::Create,
            Event::Write { .. } => EventKind::Write,
            Event::Delete { .. } => EventKind::Delete,
            Event::Query { .. } => EventKind::Query,
            Event::Close { .. } => EventKind::Close,
        }
    }

    pub fn collection(&self) -> Option<&str> {
        match self {
            Event::Create { collection, .. }
            | Event::Write { collection, .. }
            | Event::Delete { collection, .. }
            | Event::Query { collection, .. } => Some(collection),
            Event::Close { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Observer registry owned by a database instance
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(subscriber)));
        id
    }

    /// Receive events through a channel instead of a callback. The
    /// subscription stays registered after the receiver is dropped; sends
    /// to a closed channel are ignored.
    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let id = self.subscribe(move |event| {
            let _ = tx.lock().send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every current subscriber, in subscription order.
    pub fn emit(&self, event: &Event) {
        // Snapshot so subscribers may (un)subscribe from inside a callback
        let subscribers: Vec<(SubscriptionId, Subscriber)> = self.subscribers.read().clone();
        for (id, subscriber) in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                log::warn!("Subscriber {:?} panicked on {:?} event", id, event.kind());
            }
        }
    }
}
