//! Fan-out of thread updates and node status events to subscribers.
//!
//! UI layers subscribe and receive one [`ThreadUpdate`] per newly indexed
//! block. Dead subscribers (dropped receivers) are pruned on send.

use crate::crypto::keys::ThreadId;
use crate::store::BlockRow;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use tracing::trace;

/// Notification that a block was indexed into a thread.
#[derive(Debug, Clone)]
pub struct ThreadUpdate {
    pub block: BlockRow,
    pub thread_id: ThreadId,
    pub thread_name: String,
}

/// Node-level status events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A root publish began (only the first of an overlapping batch emits).
    Publishing,
    /// The last in-flight publish finished.
    PublishComplete,
    /// The last in-flight publish failed; the next seed cycle retries.
    PublishFailed,
}

/// Fan-out bus for updates and status events.
#[derive(Default)]
pub struct UpdateBus {
    update_subs: Mutex<Vec<Sender<ThreadUpdate>>>,
    status_subs: Mutex<Vec<Sender<StatusEvent>>>,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to thread updates.
    pub fn subscribe(&self) -> Receiver<ThreadUpdate> {
        let (tx, rx) = channel();
        self.update_subs.lock().expect("bus lock poisoned").push(tx);
        rx
    }

    /// Subscribes to node status events.
    pub fn subscribe_status(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = channel();
        self.status_subs.lock().expect("bus lock poisoned").push(tx);
        rx
    }

    /// Publishes a thread update to every live subscriber.
    pub fn publish(&self, update: ThreadUpdate) {
        trace!(thread = %update.thread_id, block = %update.block.id.short(), "pushing update");
        self.update_subs
            .lock()
            .expect("bus lock poisoned")
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Publishes a status event to every live subscriber.
    pub fn publish_status(&self, event: StatusEvent) {
        self.status_subs
            .lock()
            .expect("bus lock poisoned")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live update subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.update_subs.lock().expect("bus lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockId, BlockType};
    use crate::crypto::keys::PeerId;

    fn make_update(tag: u8) -> ThreadUpdate {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        ThreadUpdate {
            block: BlockRow {
                id: BlockId::from_bytes(bytes),
                thread_id: ThreadId::from_string("t1".to_string()),
                author_id: PeerId::from_string("p1".to_string()),
                block_type: BlockType::Message,
                date_ms: 1,
                parents: vec![],
                target: None,
                body: "hi".to_string(),
            },
            thread_id: ThreadId::from_string("t1".to_string()),
            thread_name: "holidays".to_string(),
        }
    }

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let bus = UpdateBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish(make_update(1));

        assert_eq!(rx1.recv().unwrap().thread_name, "holidays");
        assert_eq!(rx2.recv().unwrap().thread_name, "holidays");
    }

    #[test]
    fn test_dead_subscribers_are_pruned() {
        let bus = UpdateBus::new();
        let rx1 = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(make_update(1));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx1.recv().is_ok());
    }

    #[test]
    fn test_status_events() {
        let bus = UpdateBus::new();
        let rx = bus.subscribe_status();
        bus.publish_status(StatusEvent::Publishing);
        bus.publish_status(StatusEvent::PublishComplete);
        assert_eq!(rx.recv().unwrap(), StatusEvent::Publishing);
        assert_eq!(rx.recv().unwrap(), StatusEvent::PublishComplete);
    }
}
