use std::{
    collections::VecDeque,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::protocol::Message;

/// Per-connection FIFO of server-initiated messages.
///
/// Any thread may push; only the owning handler pops. Depth is capped: pushing onto a
/// full queue evicts the oldest message.
pub struct Outbox {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    dropped: AtomicUsize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `message`, returning the message evicted to make room, if any.
    pub fn push(&self, message: Message) -> Option<Message> {
        let mut queue = self.lock();
        let evicted = if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(message);
        evicted
    }

    /// Removes up to `max` messages in insertion order.
    pub fn pop_batch(&self, max: usize) -> Vec<Message> {
        let mut queue = self.lock();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Messages evicted so far.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
