// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic record, per-topic statistics and the fan-out worker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::constants;
use crate::error::{Error, ErrorKind};
use crate::message::{Callback, Cookie, Message, MessageView, Subscriber};
use crate::pool::{MemoryPool, PoolBuf};
use crate::queue::MsgQueue;
use crate::types::{Clock, Priority, QoS};

/// Per-topic configuration.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Largest accepted payload, in bytes.
    pub max_msg_size: usize,

    /// Ingress queue depth.
    pub queue_size: usize,

    /// Default delivery guarantee of the topic.
    pub qos: QoS,

    /// Keep a copy of the last successfully published message and hand it
    /// to freshly subscribing callbacks.
    pub retain_last: bool,

    /// Messages older than this at dequeue time are dropped undelivered.
    /// 0 disables expiry.
    pub message_ttl_ms: u64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            max_msg_size: constants::MAX_MSG_SIZE,
            queue_size: constants::MAX_QUEUE_SIZE,
            qos: QoS::AtMostOnce,
            retain_last: false,
            message_ttl_ms: 0,
        }
    }
}

/// Per-topic statistics snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TopicStats {
    /// Messages dequeued by the worker.
    pub msg_received: u64,

    /// Messages successfully enqueued.
    pub msg_published: u64,

    /// Messages dropped on a full queue or past their TTL.
    pub msg_dropped: u64,

    pub subscriber_count: u32,

    /// Dequeue time of the most recent message, in clock microseconds.
    pub last_msg_timestamp: u64,

    pub queue_space_available: usize,
}

/// The most recent message of a retain-enabled topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub timestamp: u64,
}

#[derive(Debug)]
struct Retained {
    payload: Option<PoolBuf>,
    priority: Priority,
    timestamp: u64,
}

impl Retained {
    fn to_message(&self) -> RetainedMessage {
        RetainedMessage {
            payload: self.payload.as_deref().unwrap_or(&[]).to_vec(),
            priority: self.priority,
            timestamp: self.timestamp,
        }
    }
}

/// Stats and the retained slot, guarded separately from the subscriber
/// list so publishers never wait behind a running fan-out.
#[derive(Debug, Default)]
struct TopicState {
    stats: TopicStats,
    retained: Option<Retained>,
}

/// A named channel: bounded ingress queue, subscriber list, statistics
/// and an optional retained-message slot.
///
/// The list mutex is held by the worker across a whole fan-out and by
/// subscribe/unsubscribe; the state mutex guards counters and the
/// retained slot only and is never held across a callback. Lock order is
/// list before state.
#[derive(Debug)]
pub struct Topic {
    name: Arc<str>,
    config: TopicConfig,
    max_subscribers: usize,
    queue: MsgQueue,
    subscribers: Mutex<Vec<Subscriber>>,
    state: Mutex<TopicState>,
}

impl Topic {
    pub(crate) fn new(name: &str, config: TopicConfig, max_subscribers: usize) -> Self {
        let queue = MsgQueue::new(config.queue_size);
        Self {
            name: Arc::from(name),
            config,
            max_subscribers,
            queue,
            subscribers: Mutex::new(Vec::new()),
            state: Mutex::new(TopicState::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &TopicConfig {
        &self.config
    }

    /// Register a subscriber. The callback may not be registered twice on
    /// the same topic. On a retain-enabled topic the retained message, if
    /// any, is delivered to the new subscriber before this returns.
    pub(crate) fn subscribe(&self, callback: Callback, cookie: Cookie) -> Result<(), Error> {
        let mut subscribers = self.lock_subscribers();
        if subscribers.iter().any(|sub| sub.matches(&callback)) {
            return Err(Error::from_string(
                ErrorKind::InvalidParam,
                format!("topic {}: callback already subscribed", self.name),
            ));
        }
        if subscribers.len() >= self.max_subscribers {
            return Err(Error::from_string(
                ErrorKind::MaxSubscribers,
                format!("topic {}: subscriber ceiling reached", self.name),
            ));
        }

        subscribers.insert(0, Subscriber::new(callback, cookie));
        let retained = {
            let mut state = self.lock_state();
            state.stats.subscriber_count += 1;
            if self.config.retain_last {
                state.retained.as_ref().map(Retained::to_message)
            } else {
                None
            }
        };
        log::info!("topic {}: new subscriber added", self.name);

        if let Some(retained) = retained {
            let view = MessageView {
                topic: &self.name,
                payload: &retained.payload,
                priority: retained.priority,
                timestamp: retained.timestamp,
            };
            subscribers[0].invoke(&view);
        }
        Ok(())
    }

    /// Remove the subscriber registered with this callback.
    pub(crate) fn unsubscribe(&self, callback: &Callback) -> Result<(), Error> {
        let mut subscribers = self.lock_subscribers();
        let Some(pos) = subscribers.iter().position(|sub| sub.matches(callback)) else {
            return Err(Error::from_string(
                ErrorKind::InvalidParam,
                format!("topic {}: callback not subscribed", self.name),
            ));
        };
        subscribers.remove(pos);
        self.lock_state().stats.subscriber_count -= 1;
        log::info!("topic {}: subscriber removed", self.name);
        Ok(())
    }

    /// Copy `data` into the pool and enqueue it. A full queue drops the
    /// message, releases the copy and counts it; pool exhaustion has no
    /// side effects. Never waits on a running fan-out.
    pub(crate) fn publish(
        &self,
        pool: &Arc<MemoryPool>,
        data: &[u8],
        priority: Priority,
        now: u64,
    ) -> Result<(), Error> {
        if data.len() > self.config.max_msg_size {
            return Err(Error::from_string(
                ErrorKind::InvalidParam,
                format!(
                    "topic {}: payload of {} bytes exceeds limit {}",
                    self.name,
                    data.len(),
                    self.config.max_msg_size
                ),
            ));
        }

        let payload = if data.is_empty() {
            None
        } else {
            match pool.alloc_copy(data) {
                Some(buf) => Some(buf),
                None => {
                    return Err(Error::from_string(
                        ErrorKind::NoMemory,
                        format!("topic {}: pool exhausted", self.name),
                    ));
                }
            }
        };

        let msg = Message::new(&self.name, payload, priority, now);
        match self.queue.try_push(msg) {
            Ok(()) => {
                let mut state = self.lock_state();
                state.stats.msg_published += 1;
                if self.config.retain_last {
                    self.update_retained(&mut state, pool, data, priority, now);
                }
                log::debug!(
                    "topic {}: published {} bytes at {:?}",
                    self.name,
                    data.len(),
                    priority
                );
                Ok(())
            }
            Err(dropped) => {
                // Releases the payload copy.
                drop(dropped);
                self.lock_state().stats.msg_dropped += 1;
                Err(Error::from_string(
                    ErrorKind::QueueFull,
                    format!("topic {}: queue full, message dropped", self.name),
                ))
            }
        }
    }

    fn update_retained(
        &self,
        state: &mut TopicState,
        pool: &Arc<MemoryPool>,
        data: &[u8],
        priority: Priority,
        now: u64,
    ) {
        let payload = if data.is_empty() {
            None
        } else {
            match pool.alloc_copy(data) {
                Some(buf) => Some(buf),
                None => {
                    // Keep the previous retained message.
                    log::warn!("topic {}: no pool space for retained copy", self.name);
                    return;
                }
            }
        };
        state.retained = Some(Retained {
            payload,
            priority,
            timestamp: now,
        });
    }

    #[must_use]
    pub fn get_stats(&self) -> TopicStats {
        let mut stats = self.lock_state().stats;
        stats.queue_space_available = self.queue.remaining();
        stats
    }

    #[must_use]
    pub fn get_retained(&self) -> Option<RetainedMessage> {
        self.lock_state().retained.as_ref().map(Retained::to_message)
    }

    /// Drop everything still queued, counting the messages as dropped.
    pub(crate) fn flush(&self) -> usize {
        let flushed = self.queue.drain();
        let count = flushed.len();
        if count > 0 {
            self.lock_state().stats.msg_dropped += count as u64;
        }
        count
    }

    /// Stop the worker and release every queued payload, the subscriber
    /// list and the retained slot. Nothing is delivered.
    pub(crate) fn teardown(&self) {
        self.lock_subscribers().clear();
        {
            let mut state = self.lock_state();
            state.stats.subscriber_count = 0;
            state.retained = None;
        }

        self.queue.close();
        let drained = self.queue.drain();
        if !drained.is_empty() {
            log::info!(
                "topic {}: dropped {} queued messages on delete",
                self.name,
                drained.len()
            );
        }
    }

    /// Cooperative fan-out loop. Exits when the queue is closed and
    /// drained.
    pub(crate) async fn run_loop(self: Arc<Self>, clock: Clock) {
        log::info!("topic {}: worker started", self.name);
        while let Some(msg) = self.queue.pop().await {
            let now = clock.now_micros();
            if self.expired(&msg, now) {
                self.lock_state().stats.msg_dropped += 1;
                log::debug!("topic {}: message expired before delivery", self.name);
                continue;
            }

            let subscribers = self.lock_subscribers();
            {
                let mut state = self.lock_state();
                state.stats.msg_received += 1;
                state.stats.last_msg_timestamp = now;
            }
            let view = msg.view();
            for subscriber in subscribers.iter() {
                subscriber.invoke(&view);
            }
            drop(subscribers);
            // `msg` drops here, returning its payload to the pool.
        }
        log::info!("topic {}: worker stopped", self.name);
    }

    fn expired(&self, msg: &Message, now: u64) -> bool {
        self.config.message_ttl_ms > 0
            && now.saturating_sub(msg.timestamp()) > self.config.message_ttl_ms * 1000
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        // A panicking subscriber callback must not wedge the topic.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Topic, TopicConfig};
    use crate::message::{Callback, Cookie};
    use crate::pool::MemoryPool;
    use crate::types::Priority;

    fn noop_callback() -> Callback {
        Arc::new(|_view, _cookie| {})
    }

    fn cookie() -> Cookie {
        Arc::new(())
    }

    fn new_topic(config: TopicConfig) -> Topic {
        Topic::new("sensor/t", config, 4)
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip() {
        let topic = new_topic(TopicConfig::default());
        let callback = noop_callback();

        topic.subscribe(callback.clone(), cookie()).unwrap();
        assert_eq!(topic.get_stats().subscriber_count, 1);

        topic.unsubscribe(&callback).unwrap();
        assert_eq!(topic.get_stats().subscriber_count, 0);
        assert!(topic.unsubscribe(&callback).is_err());
    }

    #[test]
    fn test_duplicate_subscribe_is_rejected() {
        let topic = new_topic(TopicConfig::default());
        let callback = noop_callback();
        topic.subscribe(callback.clone(), cookie()).unwrap();
        assert!(topic.subscribe(callback, cookie()).is_err());
        assert_eq!(topic.get_stats().subscriber_count, 1);
    }

    #[test]
    fn test_subscriber_ceiling() {
        let topic = new_topic(TopicConfig::default());
        for _ in 0..4 {
            topic.subscribe(noop_callback(), cookie()).unwrap();
        }
        let overflow = topic.subscribe(noop_callback(), cookie());
        assert!(overflow.is_err());
        assert_eq!(topic.get_stats().subscriber_count, 4);
    }

    #[test]
    fn test_publish_updates_stats_and_queue_space() {
        let pool = Arc::new(MemoryPool::new(16, 128).unwrap());
        let topic = new_topic(TopicConfig {
            queue_size: 2,
            ..TopicConfig::default()
        });

        topic.publish(&pool, b"one", Priority::Normal, 1).unwrap();
        topic.publish(&pool, b"two", Priority::Normal, 2).unwrap();
        let full = topic.publish(&pool, b"three", Priority::Normal, 3);
        assert!(full.is_err());

        let stats = topic.get_stats();
        assert_eq!(stats.msg_published, 2);
        assert_eq!(stats.msg_dropped, 1);
        assert_eq!(stats.queue_space_available, 0);
        // The dropped payload went back to the pool.
        assert_eq!(pool.stats().used, 2 * (8 + crate::pool::HEADER_SIZE));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let pool = Arc::new(MemoryPool::new(16, 128).unwrap());
        let topic = new_topic(TopicConfig {
            max_msg_size: 4,
            ..TopicConfig::default()
        });
        let result = topic.publish(&pool, b"too long", Priority::Normal, 0);
        assert!(result.is_err());
        assert_eq!(topic.get_stats().msg_published, 0);
        assert_eq!(pool.stats().used, 0);
    }

    #[test]
    fn test_retained_message_replaced_on_publish() {
        let pool = Arc::new(MemoryPool::new(16, 128).unwrap());
        let topic = new_topic(TopicConfig {
            retain_last: true,
            ..TopicConfig::default()
        });

        topic.publish(&pool, b"first", Priority::Normal, 1).unwrap();
        assert_eq!(topic.get_retained().unwrap().payload, b"first");

        topic.publish(&pool, b"second", Priority::High, 2).unwrap();
        let retained = topic.get_retained().unwrap();
        assert_eq!(retained.payload, b"second");
        assert_eq!(retained.priority, Priority::High);
        assert_eq!(retained.timestamp, 2);
    }

    #[test]
    fn test_retained_delivered_to_new_subscriber() {
        let pool = Arc::new(MemoryPool::new(16, 128).unwrap());
        let topic = new_topic(TopicConfig {
            retain_last: true,
            ..TopicConfig::default()
        });
        topic.publish(&pool, b"25.5", Priority::Normal, 1).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Callback = Arc::new(move |view, _cookie| {
            sink.lock().unwrap().push(view.payload.to_vec());
        });
        topic.subscribe(callback, cookie()).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), [b"25.5".to_vec()]);
    }

    #[test]
    fn test_teardown_releases_queued_payloads() {
        let pool = Arc::new(MemoryPool::new(16, 128).unwrap());
        let topic = new_topic(TopicConfig::default());
        topic.subscribe(noop_callback(), cookie()).unwrap();
        topic.publish(&pool, b"queued", Priority::Normal, 1).unwrap();
        assert!(pool.stats().used > 0);

        topic.teardown();
        assert_eq!(pool.stats().used, 0);
        assert_eq!(topic.get_stats().subscriber_count, 0);
        assert!(topic.publish(&pool, b"late", Priority::Normal, 2).is_err());
    }
}
