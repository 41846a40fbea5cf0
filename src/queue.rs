// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Bounded per-topic ingress queue with front-insert for critical messages.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::message::Message;
use crate::types::Priority;

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<Message>,
    closed: bool,
}

/// Enqueue never blocks; a full or closed queue rejects immediately.
/// Critical messages are inserted behind any already-queued critical
/// messages and ahead of everything else, so criticals form a FIFO at the
/// head while the rest form a FIFO in the tail region.
///
/// `pop` is single-consumer: one topic worker waits per queue.
#[derive(Debug)]
pub struct MsgQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl MsgQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Non-blocking enqueue. The message is handed back when the queue is
    /// at capacity or closed.
    pub fn try_push(&self, msg: Message) -> Result<(), Message> {
        {
            let mut inner = self.lock();
            if inner.closed || inner.items.len() >= self.capacity {
                return Err(msg);
            }
            if msg.priority() == Priority::Critical {
                let pos = inner
                    .items
                    .iter()
                    .take_while(|queued| queued.priority() == Priority::Critical)
                    .count();
                inner.items.insert(pos, msg);
            } else {
                inner.items.push_back(msg);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next message. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(msg) = inner.items.pop_front() {
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Reject further enqueues and wake the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<Message> {
        self.lock().items.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left in the queue.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::MsgQueue;
    use crate::message::Message;
    use crate::types::Priority;

    fn msg(tag: &str, priority: Priority) -> Message {
        Message::new(tag, None, priority, 0)
    }

    fn topics(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.topic().to_string()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = MsgQueue::new(4);
        queue.try_push(msg("n1", Priority::Normal)).unwrap();
        queue.try_push(msg("n2", Priority::Low)).unwrap();
        queue.try_push(msg("n3", Priority::High)).unwrap();
        assert_eq!(topics(&queue.drain()), ["n1", "n2", "n3"]);
    }

    #[test]
    fn test_critical_front_insert_keeps_critical_fifo() {
        let queue = MsgQueue::new(8);
        queue.try_push(msg("n1", Priority::Normal)).unwrap();
        queue.try_push(msg("n2", Priority::Normal)).unwrap();
        queue.try_push(msg("c1", Priority::Critical)).unwrap();
        queue.try_push(msg("c2", Priority::Critical)).unwrap();
        queue.try_push(msg("n3", Priority::Normal)).unwrap();
        assert_eq!(topics(&queue.drain()), ["c1", "c2", "n1", "n2", "n3"]);
    }

    #[test]
    fn test_capacity_rejects() {
        let queue = MsgQueue::new(4);
        for i in 0..4 {
            queue
                .try_push(msg(&format!("n{i}"), Priority::Normal))
                .unwrap();
        }
        assert!(queue.try_push(msg("n5", Priority::Normal)).is_err());
        // A full queue rejects critical messages as well.
        assert!(queue.try_push(msg("c1", Priority::Critical)).is_err());
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn test_pop_returns_queued_then_none_after_close() {
        let queue = MsgQueue::new(4);
        queue.try_push(msg("n1", Priority::Normal)).unwrap();
        queue.close();
        assert!(queue.try_push(msg("n2", Priority::Normal)).is_err());

        tokio_test::block_on(async {
            let first = queue.pop().await.unwrap();
            assert_eq!(first.topic(), "n1");
            assert!(queue.pop().await.is_none());
        });
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(MsgQueue::new(4));
        let producer = std::sync::Arc::clone(&queue);
        tokio_test::block_on(async move {
            let push = tokio::spawn(async move {
                producer.try_push(msg("n1", Priority::Normal)).unwrap();
            });
            let popped = queue.pop().await.unwrap();
            assert_eq!(popped.topic(), "n1");
            push.await.unwrap();
        });
    }
}
