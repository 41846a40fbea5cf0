// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! `Bus` is the main entry point of the message bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::fault::{self, FaultHandle};
use crate::message::{Callback, Cookie};
use crate::overlay::{AckCallback, ReliableOverlay};
use crate::pool::{MemoryPool, PoolStats};
use crate::registry::TopicRegistry;
use crate::topic::{RetainedMessage, TopicConfig, TopicStats};
use crate::transport::{AckIngress, AckSource};
use crate::types::{Clock, MessageId, Priority, QoS};

/// The message bus.
///
/// One value constructed at init owns the payload pool, the topic slot
/// table, the reliable-delivery overlay and the fault handler. Every
/// operation is callable from any task context; topic workers, the retry
/// loop and the fault drain run as background tasks.
///
/// Construction and topic creation must happen within a tokio runtime.
#[derive(Debug)]
pub struct Bus {
    config: Config,
    pool: Arc<MemoryPool>,
    registry: Arc<TopicRegistry>,
    overlay: Arc<ReliableOverlay>,
    fault: FaultHandle,
    clock: Clock,
}

impl Bus {
    /// Construct the bus and start its background tasks.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the payload pool cannot
    /// be laid out.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let clock = Clock::new();
        let fault = fault::spawn(config.general().fatal_grace(), clock.clone());
        let pool = MemoryPool::new(config.pool().pool_blocks(), config.pool().block_size())
            .map_err(|err| {
                fault.report(
                    fault::Severity::Fatal,
                    ErrorKind::NoMemory,
                    format!("Failed to lay out payload pool: {err}"),
                );
                err
            })?;
        let pool = Arc::new(pool);
        let registry = Arc::new(TopicRegistry::new(config.general(), clock.clone()));
        let overlay = Arc::new(ReliableOverlay::new(
            config.overlay(),
            Arc::clone(&pool),
            Arc::clone(&registry),
            clock.clone(),
            fault.clone(),
        ));
        tokio::spawn(Arc::clone(&overlay).run_loop());

        log::info!("bus: initialized");
        Ok(Self {
            config,
            pool,
            registry,
            overlay,
            fault,
            clock,
        })
    }

    /// Create a topic with the configured default limits.
    ///
    /// # Errors
    ///
    /// `InvalidParam`, `TopicExists` or `NoMemory`, see
    /// [`TopicRegistry::create`].
    pub fn create_topic(&self, name: &str) -> Result<(), Error> {
        self.create_topic_with_config(name, self.default_topic_config())
    }

    /// Create a topic with explicit per-topic configuration.
    ///
    /// # Errors
    ///
    /// `InvalidParam`, `TopicExists` or `NoMemory`, see
    /// [`TopicRegistry::create`].
    pub fn create_topic_with_config(&self, name: &str, config: TopicConfig) -> Result<(), Error> {
        self.registry.create(name, config)
    }

    /// Delete a topic: queued messages are dropped undelivered, its
    /// subscribers are discarded and its pending retries cancelled.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` if no topic has this name.
    pub fn delete_topic(&self, name: &str) -> Result<(), Error> {
        self.registry.delete(name)?;
        self.overlay.flush_topic(name);
        Ok(())
    }

    /// Register a callback on a topic.
    ///
    /// The callback runs on the topic worker and must not re-enter bus
    /// operations that take the registry lock. A callback may be
    /// registered at most once per topic; identity is the `Callback`
    /// clone itself.
    ///
    /// # Errors
    ///
    /// `TopicNotFound`, `InvalidParam` on a duplicate, `MaxSubscribers`
    /// at the per-topic ceiling.
    pub fn subscribe(&self, name: &str, callback: Callback, cookie: Cookie) -> Result<(), Error> {
        let topic = self
            .registry
            .get(name)
            .ok_or_else(|| Error::topic_not_found(name))?;
        topic.subscribe(callback, cookie)
    }

    /// Remove a callback from a topic. An in-flight fan-out already past
    /// the subscriber is not cancelled.
    ///
    /// # Errors
    ///
    /// `TopicNotFound`, or `InvalidParam` when the callback is not
    /// subscribed.
    pub fn unsubscribe(&self, name: &str, callback: &Callback) -> Result<(), Error> {
        let topic = self
            .registry
            .get(name)
            .ok_or_else(|| Error::topic_not_found(name))?;
        topic.unsubscribe(callback)
    }

    /// Publish at QoS 0. The payload is copied into the pool; enqueue is
    /// non-blocking and a full queue drops the message.
    ///
    /// # Errors
    ///
    /// `InvalidParam`, `TopicNotFound`, `NoMemory` or `QueueFull`.
    pub fn publish(&self, name: &str, data: &[u8], priority: Priority) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidParam, "bus: empty topic name"));
        }
        self.registry
            .publish(&self.pool, name, data, priority, self.clock.now_micros())
    }

    /// Publish with a delivery guarantee and get the tracking id back.
    /// See [`ReliableOverlay::publish_with_qos`].
    ///
    /// # Errors
    ///
    /// `InvalidParam`, `NoMemory`; for QoS 0 also any inner publish
    /// error.
    pub fn publish_with_qos(
        &self,
        name: &str,
        data: &[u8],
        priority: Priority,
        qos: QoS,
    ) -> Result<MessageId, Error> {
        self.overlay.publish_with_qos(name, data, priority, qos)
    }

    /// Acknowledge a pending message.
    ///
    /// # Errors
    ///
    /// `InvalidParam` when no pending record matches, including records
    /// already retired by the retry ceiling.
    pub fn acknowledge(&self, name: &str, msg_id: MessageId) -> Result<(), Error> {
        self.overlay.acknowledge(name, msg_id)
    }

    /// Snapshot of a topic's statistics.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` if no topic has this name.
    pub fn get_stats(&self, name: &str) -> Result<TopicStats, Error> {
        let topic = self
            .registry
            .get(name)
            .ok_or_else(|| Error::topic_not_found(name))?;
        Ok(topic.get_stats())
    }

    /// Copy of the retained message of a retain-enabled topic.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` if the topic does not exist or holds no retained
    /// message.
    pub fn get_retained(&self, name: &str) -> Result<RetainedMessage, Error> {
        let topic = self
            .registry
            .get(name)
            .ok_or_else(|| Error::topic_not_found(name))?;
        topic.get_retained().ok_or_else(|| {
            Error::from_string(
                ErrorKind::TopicNotFound,
                format!("bus: no retained message on topic {name}"),
            )
        })
    }

    /// Install the process-wide topic creation filter.
    ///
    /// # Errors
    ///
    /// `InvalidParam` if the pattern does not parse.
    pub fn set_topic_filter(&self, pattern: &str) -> Result<(), Error> {
        self.registry.set_filter(pattern)
    }

    /// Restore unconditional topic creation.
    pub fn clear_topic_filter(&self) {
        self.registry.clear_filter();
    }

    /// Drop everything queued on a topic without delivering it.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` if no topic has this name.
    pub fn flush_topic(&self, name: &str) -> Result<usize, Error> {
        let topic = self
            .registry
            .get(name)
            .ok_or_else(|| Error::topic_not_found(name))?;
        Ok(topic.flush())
    }

    /// Replace the retry policy for messages published afterwards.
    pub fn set_retry_policy(&self, max_retries: u32, retry_interval: Duration) {
        self.overlay.set_retry_policy(max_retries, retry_interval);
    }

    /// Register the callback observing pending-message retirement.
    pub fn set_ack_callback(&self, callback: AckCallback) {
        self.overlay.set_ack_callback(callback);
    }

    /// Feed decoded acknowledgements from the broker bridge into the
    /// overlay.
    pub fn attach_ack_source<S>(&self, source: S) -> JoinHandle<()>
    where
        S: AckSource + 'static,
    {
        tokio::spawn(AckIngress::new(source, Arc::clone(&self.overlay)).run_loop())
    }

    /// Payload pool usage counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Pending QoS messages tracked for a topic.
    #[must_use]
    pub fn pending_acks(&self, name: &str) -> usize {
        self.overlay.pending_count_for(name)
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.registry.topic_count()
    }

    /// Handle for reporting faults and registering a fault callback.
    #[must_use]
    pub fn fault_handle(&self) -> FaultHandle {
        self.fault.clone()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Tear down every topic and cancel all pending retries.
    pub fn shutdown(&self) {
        log::info!("bus: shutting down");
        self.registry.shutdown_all();
        self.overlay.shutdown();
    }

    fn default_topic_config(&self) -> TopicConfig {
        TopicConfig {
            max_msg_size: self.config.general().max_msg_size(),
            queue_size: self.config.general().max_queue_size(),
            ..TopicConfig::default()
        }
    }
}
