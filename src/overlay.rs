// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Reliable-delivery overlay: tracks messages published at QoS >= 1 and
//! drives timed retries until acknowledgement or the retry ceiling.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;

use crate::config::Overlay as OverlayConfig;
use crate::error::{Error, ErrorKind};
use crate::fault::{FaultHandle, Severity};
use crate::pool::{MemoryPool, PoolBuf};
use crate::registry::TopicRegistry;
use crate::types::{Clock, MessageId, Priority, QoS};

/// Outcome reported to the ack callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The pending message was acknowledged in time.
    Acknowledged,

    /// The retry ceiling was reached; the message was retired.
    Expired,
}

/// Callback invoked when a pending message is retired, with the topic
/// name, the message id and the outcome.
pub type AckCallback = Arc<dyn Fn(&str, MessageId, AckOutcome) + Send + Sync>;

/// Retry policy applied to records armed after the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-publish attempts after the initial publish.
    pub max_retries: u32,

    pub retry_interval: Duration,
}

#[derive(Debug)]
struct PendingRecord {
    msg_id: MessageId,
    topic: String,
    payload: PoolBuf,
    priority: Priority,
    qos: QoS,
    retry_count: u32,
    max_retries: u32,

    /// Next fire time, in clock microseconds.
    deadline: u64,

    /// Retry interval at arm time, in microseconds.
    interval: u64,
}

struct OverlayInner {
    /// Pending records, newest first.
    pending: Vec<PendingRecord>,

    next_msg_id: u32,
    policy: RetryPolicy,
    enable_ack: bool,
    ack_callback: Option<AckCallback>,
    shutdown: bool,
}

/// Process-wide pending-record set plus the id allocator.
///
/// A single task services all retry deadlines; see [`Self::run_loop`].
pub struct ReliableOverlay {
    inner: Mutex<OverlayInner>,
    notify: Notify,
    pool: Arc<MemoryPool>,
    registry: Arc<TopicRegistry>,
    clock: Clock,
    fault: FaultHandle,
}

impl ReliableOverlay {
    #[must_use]
    pub fn new(
        config: &OverlayConfig,
        pool: Arc<MemoryPool>,
        registry: Arc<TopicRegistry>,
        clock: Clock,
        fault: FaultHandle,
    ) -> Self {
        // Start somewhere unpredictable; 0 stays reserved.
        let next_msg_id = rand::rng().random_range(1..=u32::MAX);
        Self {
            inner: Mutex::new(OverlayInner {
                pending: Vec::new(),
                next_msg_id,
                policy: RetryPolicy {
                    max_retries: config.retry_count(),
                    retry_interval: config.retry_interval(),
                },
                enable_ack: config.enable_ack(),
                ack_callback: None,
                shutdown: false,
            }),
            notify: Notify::new(),
            pool,
            registry,
            clock,
            fault,
        }
    }

    /// Publish with a delivery guarantee. QoS >= 1 arms a pending record
    /// that is retried until acknowledged or retired; QoS 2 is handled
    /// identically to QoS 1.
    ///
    /// The immediate publish attempt of an armed record may fail (full
    /// queue, missing topic); the record stays armed and the retry loop
    /// takes over, so the allocated id is still returned.
    ///
    /// # Errors
    ///
    /// `InvalidParam` on an empty name or payload; `NoMemory` when no
    /// pool block is left for the record copy; for plain QoS 0, any error
    /// of the inner publish path.
    pub fn publish_with_qos(
        &self,
        name: &str,
        data: &[u8],
        priority: Priority,
        qos: QoS,
    ) -> Result<MessageId, Error> {
        if name.is_empty() || data.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidParam,
                "overlay: empty topic name or payload",
            ));
        }

        let msg_id;
        let armed = qos > QoS::AtMostOnce;
        {
            let mut inner = self.lock();
            msg_id = Self::alloc_id(&mut inner);
            if armed {
                let Some(payload) = self.pool.alloc_copy(data) else {
                    return Err(Error::from_string(
                        ErrorKind::NoMemory,
                        format!("overlay: pool exhausted for pending message {msg_id}"),
                    ));
                };
                let interval =
                    u64::try_from(inner.policy.retry_interval.as_micros()).unwrap_or(u64::MAX);
                let record = PendingRecord {
                    msg_id,
                    topic: name.to_owned(),
                    payload,
                    priority,
                    qos,
                    retry_count: 0,
                    max_retries: inner.policy.max_retries,
                    deadline: self.clock.now_micros() + interval,
                    interval,
                };
                log::debug!(
                    "overlay: armed message {msg_id} for {name} at {:?}",
                    record.qos
                );
                inner.pending.insert(0, record);
            }
        }
        if armed {
            // Wake the retry loop so it re-arms to the new deadline.
            self.notify.notify_one();
        }

        let now = self.clock.now_micros();
        match self.registry.publish(&self.pool, name, data, priority, now) {
            Ok(()) => Ok(msg_id),
            Err(err) if armed => {
                log::warn!(
                    "overlay: initial publish of message {msg_id} to {name} failed: {err}, \
                     leaving it to the retry loop"
                );
                Ok(msg_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Retire a pending record on acknowledgement.
    ///
    /// # Errors
    ///
    /// `InvalidParam` when no record matches; a record already retired by
    /// the retry ceiling never resurrects, so a late ack lands here too.
    pub fn acknowledge(&self, name: &str, msg_id: MessageId) -> Result<(), Error> {
        let callback = {
            let mut inner = self.lock();
            let Some(pos) = inner
                .pending
                .iter()
                .position(|record| record.msg_id == msg_id && record.topic == name)
            else {
                return Err(Error::from_string(
                    ErrorKind::InvalidParam,
                    format!("overlay: no pending message {msg_id} for topic {name}"),
                ));
            };
            // Dropping the record releases its payload copy.
            let record = inner.pending.remove(pos);
            drop(record);
            if inner.enable_ack {
                inner.ack_callback.clone()
            } else {
                None
            }
        };

        log::debug!("overlay: message {msg_id} on {name} acknowledged");
        if let Some(callback) = callback {
            callback(name, msg_id, AckOutcome::Acknowledged);
        }
        Ok(())
    }

    /// Replace the retry policy for records armed afterwards.
    pub fn set_retry_policy(&self, max_retries: u32, retry_interval: Duration) {
        let mut inner = self.lock();
        inner.policy = RetryPolicy {
            max_retries,
            retry_interval,
        };
    }

    pub fn set_ack_callback(&self, callback: AckCallback) {
        self.lock().ack_callback = Some(callback);
    }

    /// Cancel every record targeting `name`. No callback fires.
    pub fn flush_topic(&self, name: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.pending.len();
        inner.pending.retain(|record| record.topic != name);
        let flushed = before - inner.pending.len();
        if flushed > 0 {
            log::info!("overlay: {flushed} pending messages for {name} cancelled");
        }
        flushed
    }

    /// Cancel all records and stop the retry loop.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.pending.clear();
        inner.shutdown = true;
        drop(inner);
        self.notify.notify_one();
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn pending_count_for(&self, name: &str) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|record| record.topic == name)
            .count()
    }

    /// Deadline-driven retry loop; one task services every pending
    /// record.
    pub async fn run_loop(self: Arc<Self>) {
        log::info!("overlay: retry worker started");
        loop {
            let wait = {
                let inner = self.lock();
                if inner.shutdown {
                    break;
                }
                inner
                    .pending
                    .iter()
                    .map(|record| record.deadline)
                    .min()
                    .map(|deadline| deadline.saturating_sub(self.clock.now_micros()))
            };

            match wait {
                None => self.notify.notified().await,
                Some(micros) if micros > 0 => {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_micros(micros)) => {}
                        () = self.notify.notified() => {}
                    }
                }
                Some(_) => self.fire_due(),
            }
        }
        log::info!("overlay: retry worker stopped");
    }

    /// Handle every record whose deadline has passed: re-publish those
    /// with retries remaining, retire the rest.
    fn fire_due(&self) {
        let now = self.clock.now_micros();
        let mut retries: Vec<(String, Vec<u8>, Priority)> = Vec::new();
        let mut expired: Vec<(String, MessageId)> = Vec::new();
        let callback = {
            let mut inner = self.lock();
            let mut i = 0;
            while i < inner.pending.len() {
                if inner.pending[i].deadline > now {
                    i += 1;
                    continue;
                }
                if inner.pending[i].retry_count < inner.pending[i].max_retries {
                    let record = &mut inner.pending[i];
                    record.retry_count += 1;
                    record.deadline = now + record.interval;
                    retries.push((
                        record.topic.clone(),
                        record.payload.to_vec(),
                        record.priority,
                    ));
                    i += 1;
                } else {
                    // Retired records never resurrect.
                    let record = inner.pending.remove(i);
                    expired.push((record.topic.clone(), record.msg_id));
                }
            }
            if inner.enable_ack {
                inner.ack_callback.clone()
            } else {
                None
            }
        };

        for (topic, data, priority) in retries {
            let result =
                self.registry
                    .publish(&self.pool, &topic, &data, priority, self.clock.now_micros());
            if let Err(err) = result {
                // A failed re-publish still counts as a retry attempt.
                log::error!("overlay: retry publish to {topic} failed: {err}");
                self.fault.report(
                    Severity::Error,
                    ErrorKind::SystemError,
                    format!("Failed to retry message to topic {topic}"),
                );
            }
        }

        for (topic, msg_id) in expired {
            log::warn!("overlay: message {msg_id} to topic {topic} exceeded max retries");
            self.fault.report(
                Severity::Warning,
                ErrorKind::Timeout,
                format!("Message {msg_id} to topic {topic} exceeded max retries"),
            );
            if let Some(callback) = &callback {
                callback(&topic, msg_id, AckOutcome::Expired);
            }
        }
    }

    fn alloc_id(inner: &mut OverlayInner) -> MessageId {
        let id = inner.next_msg_id;
        inner.next_msg_id = inner.next_msg_id.wrapping_add(1);
        if inner.next_msg_id == 0 {
            inner.next_msg_id = 1;
        }
        id
    }

    fn lock(&self) -> MutexGuard<'_, OverlayInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ReliableOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableOverlay")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::OverlayInner;
    use crate::types::QoS;

    #[test]
    fn test_id_wrap_skips_zero() {
        let mut inner = OverlayInner {
            pending: Vec::new(),
            next_msg_id: u32::MAX,
            policy: super::RetryPolicy {
                max_retries: 3,
                retry_interval: std::time::Duration::from_millis(100),
            },
            enable_ack: true,
            ack_callback: None,
            shutdown: false,
        };
        assert_eq!(super::ReliableOverlay::alloc_id(&mut inner), u32::MAX);
        // 0 is reserved and skipped on wrap.
        assert_eq!(super::ReliableOverlay::alloc_id(&mut inner), 1);
        assert_eq!(super::ReliableOverlay::alloc_id(&mut inner), 2);
    }

    #[test]
    fn test_qos_ordering_gates_arming() {
        assert!(QoS::AtLeastOnce > QoS::AtMostOnce);
        assert!(QoS::ExactOnce > QoS::AtMostOnce);
    }
}
