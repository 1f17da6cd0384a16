//! Fan-out hub for streaming subscribers.
//!
//! Every subscriber gets its own bounded channel. Publishing is
//! best-effort: a subscriber that fell behind or disconnected is skipped
//! (and pruned once its channel closes) without affecting anyone else.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc;

use crate::agent::Notification;

/// Size of the per-subscriber send buffer.
const SUBSCRIBER_BUFFER_SIZE: usize = 64;

/// Multi-subscriber notification broadcaster.
pub struct EventHub {
    subscribers: DashMap<usize, mpsc::Sender<Notification>>,
    next_id: AtomicUsize,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Register a subscriber. Returns its receiver and the id to pass to
    /// [`EventHub::unsubscribe`] on disconnect.
    pub fn subscribe(&self) -> (mpsc::Receiver<Notification>, usize) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        debug!("subscriber {id} registered ({} active)", self.subscribers.len());
        (rx, id)
    }

    pub fn unsubscribe(&self, id: usize) {
        if self.subscribers.remove(&id).is_some() {
            debug!("subscriber {id} unregistered ({} active)", self.subscribers.len());
        }
    }

    /// Push a notification to every current subscriber.
    pub fn publish(&self, notification: &Notification) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(notification.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow subscriber: drop this notification for it only.
                    debug!("subscriber {} lagging, notification dropped", entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
