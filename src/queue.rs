//! Thread-safe FIFO carrying events from protocol threads to the host thread

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

struct Shared<T> {
    events: Mutex<VecDeque<T>>,
    notify: Notify,
}

/// Multi-producer queue drained by the single thread owning a [`crate::Context`]
///
/// Clones share the same queue.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        EventQueue {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        EventQueue {
            shared: Arc::new(Shared {
                events: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Append an event and wake anyone waiting on the queue
    pub fn push(&self, event: T) {
        self.shared.events.lock().unwrap().push_back(event);
        self.shared.notify.notify_one();
    }

    pub fn pop(&self) -> Option<T> {
        self.shared.events.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every queued event matching `predicate`, preserving order of the rest
    ///
    /// The removed events are returned rather than dropped, so that any side effects
    /// of dropping them happen after the queue lock is released.
    #[must_use = "removed events are dropped by the caller, outside the lock"]
    pub fn purge(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let mut events = self.shared.events.lock().unwrap();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(events.len());
        for event in events.drain(..) {
            if predicate(&event) {
                removed.push(event);
            } else {
                kept.push_back(event);
            }
        }
        *events = kept;
        removed
    }

    /// Wait until at least one event is queued
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
