// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Message carrier and subscriber registration types.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::pool::PoolBuf;
use crate::types::Priority;

/// Opaque subscriber cookie. Owned by the caller; the bus never inspects
/// or outlives it beyond handing it back to the callback.
pub type Cookie = Arc<dyn Any + Send + Sync>;

/// Subscriber callback, invoked on the topic worker with a read-only view
/// of each delivered message.
///
/// Callbacks run under the topic mutex and must not re-enter bus
/// operations that take the registry lock (create, delete, subscribe,
/// unsubscribe, publish). Acknowledging a pending message is allowed.
pub type Callback = Arc<dyn Fn(&MessageView<'_>, &Cookie) + Send + Sync>;

/// Read-only view of a message, handed to subscriber callbacks.
#[derive(Debug, Clone, Copy)]
pub struct MessageView<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub priority: Priority,
    pub timestamp: u64,
}

/// A message carried through a topic queue.
///
/// Immutable once enqueued. The pool payload copy is owned by the message
/// and returns to the pool when the message drops, after the last
/// subscriber callback for the delivery has returned.
pub struct Message {
    topic: Arc<str>,
    payload: Option<PoolBuf>,
    priority: Priority,
    timestamp: u64,
}

impl Message {
    pub(crate) fn new(
        topic: &str,
        payload: Option<PoolBuf>,
        priority: Priority,
        timestamp: u64,
    ) -> Self {
        Self {
            topic: Arc::from(topic),
            payload,
            priority,
            timestamp,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    #[must_use]
    pub fn view(&self) -> MessageView<'_> {
        MessageView {
            topic: &self.topic,
            payload: self.payload(),
            priority: self.priority,
            timestamp: self.timestamp,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload().len())
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// A (callback, cookie) pair linked into one topic's subscriber list.
///
/// Equality is callback identity: the same `Callback` clone registers a
/// given subscriber and removes it again.
pub struct Subscriber {
    callback: Callback,
    cookie: Cookie,
}

impl Subscriber {
    pub(crate) fn new(callback: Callback, cookie: Cookie) -> Self {
        Self { callback, cookie }
    }

    pub(crate) fn matches(&self, callback: &Callback) -> bool {
        Arc::ptr_eq(&self.callback, callback)
    }

    /// Invoke the callback. A panicking callback is caught and logged so
    /// the delivery loop keeps running and the payload is still released.
    pub(crate) fn invoke(&self, view: &MessageView<'_>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(view, &self.cookie)));
        if result.is_err() {
            log::error!("subscriber: callback panicked on topic {}", view.topic);
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("callback", &Arc::as_ptr(&self.callback))
            .finish()
    }
}
