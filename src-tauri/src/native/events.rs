use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::lock;

/// Segment as reported by the host engine, timestamps in centiseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSegment {
    pub start: i64,
    pub end: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress(f32),
    NewSegment(EngineSegment),
    Completed,
    Failed(String),
    Cancelled,
}

/// Fan-out of host-engine notifications to every live [`Subscription`].
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Sender<EngineEvent>)>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push((id, tx));
        Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(self),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        lock(&self.subscribers).retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.subscribers).retain(|(sub_id, _)| *sub_id != id);
    }
}

/// Receives engine events until dropped; dropping detaches it from the bus.
pub struct Subscription {
    id: u64,
    receiver: Receiver<EngineEvent>,
    bus: Weak<EventBus>,
}

impl Subscription {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<EngineEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
