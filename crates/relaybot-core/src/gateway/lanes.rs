//! Per-chat FIFO lanes with a visible, cancellable queue.
//!
//! Each chat has one lane. The first message takes the lane immediately;
//! later messages join a queue and wait on a oneshot signal. Cancelling an
//! entry removes it from the queue so the lane hands itself to the next
//! live waiter on release. All bookkeeping sits behind one mutex; waiting
//! happens outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;

/// One queued message with its visible indicator.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub origin_message_id: i32,
    pub indicator_message_id: Option<i32>,
    pub cancelled: bool,
}

impl QueueEntry {
    pub fn new(origin_message_id: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin_message_id,
            indicator_message_id: None,
            cancelled: false,
        }
    }
}

pub enum Acquire {
    /// Lane was free; the caller holds it now.
    Immediate,
    /// Lane is busy; await the receiver. `Ok(())` means proceed (the caller
    /// now holds the lane); an error means the entry was cancelled.
    Queued(oneshot::Receiver<()>),
}

struct Waiting {
    entry: QueueEntry,
    proceed: oneshot::Sender<()>,
}

#[derive(Default)]
struct Lane {
    busy: bool,
    queue: VecDeque<Waiting>,
}

#[derive(Default)]
pub struct ChatLanes {
    lanes: Mutex<HashMap<i64, Lane>>,
}

impl ChatLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lane or join the queue.
    pub fn acquire(&self, chat_id: i64, entry: QueueEntry) -> Acquire {
        let mut lanes = self.lanes.lock().unwrap();
        let lane = lanes.entry(chat_id).or_default();
        if !lane.busy {
            lane.busy = true;
            return Acquire::Immediate;
        }
        let (proceed, rx) = oneshot::channel();
        lane.queue.push_back(Waiting { entry, proceed });
        Acquire::Queued(rx)
    }

    /// Attach the posted indicator message to a queued entry.
    pub fn set_indicator(&self, chat_id: i64, entry_id: &str, message_id: i32) {
        let mut lanes = self.lanes.lock().unwrap();
        if let Some(lane) = lanes.get_mut(&chat_id) {
            if let Some(waiting) = lane.queue.iter_mut().find(|w| w.entry.id == entry_id) {
                waiting.entry.indicator_message_id = Some(message_id);
            }
        }
    }

    /// Cancel one queued entry. Returns the removed entry so the caller can
    /// edit its indicator; `None` if it already left the queue.
    pub fn cancel(&self, chat_id: i64, entry_id: &str) -> Option<QueueEntry> {
        let mut lanes = self.lanes.lock().unwrap();
        let lane = lanes.get_mut(&chat_id)?;
        let pos = lane.queue.iter().position(|w| w.entry.id == entry_id)?;
        let mut waiting = lane.queue.remove(pos)?;
        waiting.entry.cancelled = true;
        // Dropping the sender wakes the waiter with an error.
        Some(waiting.entry)
    }

    /// Cancel every queued entry of a chat. Returns them in queue order.
    pub fn drain(&self, chat_id: i64) -> Vec<QueueEntry> {
        let mut lanes = self.lanes.lock().unwrap();
        let Some(lane) = lanes.get_mut(&chat_id) else {
            return Vec::new();
        };
        lane.queue
            .drain(..)
            .map(|mut w| {
                w.entry.cancelled = true;
                w.entry
            })
            .collect()
    }

    /// Release the lane, handing it to the next live waiter if any.
    pub fn release(&self, chat_id: i64) {
        let mut lanes = self.lanes.lock().unwrap();
        let Some(lane) = lanes.get_mut(&chat_id) else {
            return;
        };
        // Skip waiters whose receiving task died.
        while let Some(waiting) = lane.queue.pop_front() {
            if waiting.proceed.send(()).is_ok() {
                return; // lane stays busy, next waiter proceeds
            }
        }
        lane.busy = false;
    }

    pub fn is_busy(&self, chat_id: i64) -> bool {
        let lanes = self.lanes.lock().unwrap();
        lanes.get(&chat_id).map(|l| l.busy).unwrap_or(false)
    }

    pub fn queue_len(&self, chat_id: i64) -> usize {
        let lanes = self.lanes.lock().unwrap();
        lanes.get(&chat_id).map(|l| l.queue.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let lanes = ChatLanes::new();

        assert!(matches!(lanes.acquire(1, QueueEntry::new(10)), Acquire::Immediate));

        let Acquire::Queued(rx_b) = lanes.acquire(1, QueueEntry::new(11)) else {
            panic!("expected queued");
        };
        let Acquire::Queued(rx_c) = lanes.acquire(1, QueueEntry::new(12)) else {
            panic!("expected queued");
        };
        assert_eq!(lanes.queue_len(1), 2);

        // First release hands the lane to B, not C.
        lanes.release(1);
        rx_b.await.expect("B should proceed");
        assert!(lanes.is_busy(1));
        assert_eq!(lanes.queue_len(1), 1);

        lanes.release(1);
        rx_c.await.expect("C should proceed");
        lanes.release(1);
        assert!(!lanes.is_busy(1));
    }

    #[tokio::test]
    async fn test_cancel_skips_entry() {
        let lanes = ChatLanes::new();
        assert!(matches!(lanes.acquire(1, QueueEntry::new(1)), Acquire::Immediate));

        let entry_b = QueueEntry::new(2);
        let id_b = entry_b.id.clone();
        let Acquire::Queued(rx_b) = lanes.acquire(1, entry_b) else {
            panic!();
        };
        let Acquire::Queued(rx_c) = lanes.acquire(1, QueueEntry::new(3)) else {
            panic!();
        };

        let cancelled = lanes.cancel(1, &id_b).expect("entry should be cancellable");
        assert!(cancelled.cancelled);
        assert_eq!(cancelled.origin_message_id, 2);
        // B's waiter observes cancellation as a closed channel.
        assert!(rx_b.await.is_err());

        // C proceeds directly after release.
        lanes.release(1);
        rx_c.await.expect("C should proceed");
        // Double-cancel returns None.
        assert!(lanes.cancel(1, &id_b).is_none());
    }

    #[tokio::test]
    async fn test_drain_cancels_everything() {
        let lanes = ChatLanes::new();
        assert!(matches!(lanes.acquire(9, QueueEntry::new(1)), Acquire::Immediate));
        let Acquire::Queued(rx1) = lanes.acquire(9, QueueEntry::new(2)) else {
            panic!();
        };
        let Acquire::Queued(rx2) = lanes.acquire(9, QueueEntry::new(3)) else {
            panic!();
        };

        let drained = lanes.drain(9);
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|e| e.cancelled));
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());

        // The in-flight holder still releases normally.
        lanes.release(9);
        assert!(!lanes.is_busy(9));
    }

    #[test]
    fn test_chats_are_independent() {
        let lanes = ChatLanes::new();
        assert!(matches!(lanes.acquire(1, QueueEntry::new(1)), Acquire::Immediate));
        assert!(matches!(lanes.acquire(2, QueueEntry::new(1)), Acquire::Immediate));
        assert!(lanes.is_busy(1));
        assert!(lanes.is_busy(2));
    }
}
