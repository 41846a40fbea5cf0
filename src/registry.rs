// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Slot table guarding topic creation, deletion and lookup.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;

use crate::config::General;
use crate::error::{Error, ErrorKind};
use crate::filter::TopicFilter;
use crate::pool::MemoryPool;
use crate::topic::{Topic, TopicConfig};
use crate::types::{Clock, Priority};

#[derive(Debug)]
struct TopicSlot {
    topic: Arc<Topic>,

    /// Held so the worker is tied to its slot; the worker exits on its
    /// own once the topic queue is closed.
    _worker: JoinHandle<()>,
}

#[derive(Debug)]
struct RegistryInner {
    slots: Vec<Option<TopicSlot>>,
    filter: Option<TopicFilter>,
}

/// Fixed table of topic records keyed by name.
///
/// The registry mutex is held for slot acquisition and release only;
/// enqueueing, fan-out and subscriber changes run against the topic record
/// after the lock is dropped.
#[derive(Debug)]
pub struct TopicRegistry {
    inner: Mutex<RegistryInner>,
    max_topics: usize,
    max_name_len: usize,
    max_msg_size: usize,
    max_subscribers: usize,
    clock: Clock,
}

impl TopicRegistry {
    #[must_use]
    pub fn new(general: &General, clock: Clock) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: (0..general.max_topics()).map(|_| None).collect(),
                filter: None,
            }),
            max_topics: general.max_topics(),
            max_name_len: general.max_topic_name_length(),
            max_msg_size: general.max_msg_size(),
            max_subscribers: general.max_subscribers_per_topic(),
            clock,
        }
    }

    /// Create a topic and launch its worker.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidParam` on a bad name, bad config or a name refused by the
    /// active filter; `TopicExists` on a duplicate; `NoMemory` when the
    /// slot table is full.
    pub fn create(&self, name: &str, config: TopicConfig) -> Result<(), Error> {
        if name.is_empty() || name.len() >= self.max_name_len {
            return Err(Error::from_string(
                ErrorKind::InvalidParam,
                format!("registry: invalid topic name {name:?}"),
            ));
        }
        if config.queue_size == 0
            || config.max_msg_size == 0
            || config.max_msg_size > self.max_msg_size
        {
            return Err(Error::from_string(
                ErrorKind::InvalidParam,
                format!("registry: invalid config for topic {name}"),
            ));
        }

        let mut inner = self.lock();
        if Self::position(&inner, name).is_some() {
            return Err(Error::from_string(
                ErrorKind::TopicExists,
                format!("registry: topic {name} already exists"),
            ));
        }
        if let Some(filter) = &inner.filter {
            if !filter.is_match(name) {
                return Err(Error::from_string(
                    ErrorKind::InvalidParam,
                    format!(
                        "registry: topic {} rejected by filter {}",
                        name,
                        filter.pattern()
                    ),
                ));
            }
        }
        let Some(slot) = inner.slots.iter().position(Option::is_none) else {
            log::error!("registry: maximum number of topics reached");
            return Err(Error::from_string(
                ErrorKind::NoMemory,
                format!("registry: no free slot for topic {name}, max {}", self.max_topics),
            ));
        };

        let topic = Arc::new(Topic::new(name, config, self.max_subscribers));
        let worker = tokio::spawn(Arc::clone(&topic).run_loop(self.clock.clone()));
        inner.slots[slot] = Some(TopicSlot {
            topic,
            _worker: worker,
        });
        log::info!("registry: topic {name} created in slot {slot}");
        Ok(())
    }

    /// Delete a topic: stop enqueues, drop queued payloads, clear
    /// subscribers and the retained slot, let the worker exit.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` if no topic has this name.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let slot = {
            let mut inner = self.lock();
            let Some(pos) = Self::position(&inner, name) else {
                return Err(Error::topic_not_found(name));
            };
            inner.slots[pos].take()
        };
        // Teardown happens outside the registry lock.
        if let Some(slot) = slot {
            slot.topic.teardown();
            log::info!("registry: topic {name} deleted");
        }
        Ok(())
    }

    /// Look up a topic record by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        let inner = self.lock();
        Self::position(&inner, name)
            .and_then(|pos| inner.slots[pos].as_ref())
            .map(|slot| Arc::clone(&slot.topic))
    }

    /// The inner publish path: acquire the topic record, then enqueue.
    ///
    /// # Errors
    ///
    /// `TopicNotFound`, or any error of [`Topic::publish`].
    pub fn publish(
        &self,
        pool: &Arc<MemoryPool>,
        name: &str,
        data: &[u8],
        priority: Priority,
        now: u64,
    ) -> Result<(), Error> {
        let topic = self.get(name).ok_or_else(|| Error::topic_not_found(name))?;
        topic.publish(pool, data, priority, now)
    }

    /// Install the process-wide creation filter.
    ///
    /// # Errors
    ///
    /// `InvalidParam` if the pattern does not parse.
    pub fn set_filter(&self, pattern: &str) -> Result<(), Error> {
        let filter = TopicFilter::parse(pattern)?;
        log::info!("registry: topic filter set to {}", filter.pattern());
        self.lock().filter = Some(filter);
        Ok(())
    }

    /// Restore unconditional topic creation.
    pub fn clear_filter(&self) {
        self.lock().filter = None;
        log::info!("registry: topic filter cleared");
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.lock().slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Tear down every topic. Used on bus shutdown.
    pub fn shutdown_all(&self) {
        let slots: Vec<TopicSlot> = {
            let mut inner = self.lock();
            inner.slots.iter_mut().filter_map(Option::take).collect()
        };
        for slot in &slots {
            slot.topic.teardown();
        }
        log::info!("registry: {} topics torn down", slots.len());
    }

    fn position(inner: &RegistryInner, name: &str) -> Option<usize> {
        inner.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|slot| slot.topic.name() == name)
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::TopicRegistry;
    use crate::config::Config;
    use crate::pool::MemoryPool;
    use crate::topic::TopicConfig;
    use crate::types::{Clock, Priority};

    fn small_registry(max_topics: usize) -> TopicRegistry {
        let _ = env_logger::builder().is_test(true).try_init();
        let toml = format!("[general]\nmax_topics = {max_topics}\n");
        let config = Config::from_toml(&toml).unwrap();
        TopicRegistry::new(config.general(), Clock::new())
    }

    #[tokio::test]
    async fn test_create_delete_lifecycle() {
        let registry = small_registry(4);
        registry.create("sensor/t", TopicConfig::default()).unwrap();
        assert_eq!(registry.topic_count(), 1);
        assert!(registry.get("sensor/t").is_some());

        registry.delete("sensor/t").unwrap();
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.get("sensor/t").is_none());
        assert!(registry.delete("sensor/t").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_names() {
        let registry = small_registry(4);
        registry.create("sensor/t", TopicConfig::default()).unwrap();
        assert!(registry.create("sensor/t", TopicConfig::default()).is_err());
        assert!(registry.create("", TopicConfig::default()).is_err());
        let long_name = "x".repeat(256);
        assert!(registry.create(&long_name, TopicConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_slot_table_ceiling() {
        let registry = small_registry(2);
        registry.create("a", TopicConfig::default()).unwrap();
        registry.create("b", TopicConfig::default()).unwrap();
        assert!(registry.create("c", TopicConfig::default()).is_err());

        // Deleting frees a slot for reuse.
        registry.delete("a").unwrap();
        registry.create("c", TopicConfig::default()).unwrap();
    }

    #[tokio::test]
    async fn test_filter_gates_creation() {
        let registry = small_registry(4);
        registry.set_filter("sensor/+").unwrap();
        registry.create("sensor/t", TopicConfig::default()).unwrap();
        assert!(registry.create("control/led", TopicConfig::default()).is_err());

        registry.clear_filter();
        registry.create("control/led", TopicConfig::default()).unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_missing_topic() {
        let registry = small_registry(4);
        let pool = Arc::new(MemoryPool::new(16, 128).unwrap());
        let result = registry.publish(&pool, "nope", b"data", Priority::Normal, 0);
        assert!(result.is_err());
    }
}
