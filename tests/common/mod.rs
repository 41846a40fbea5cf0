// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill::bus::Bus;
use rill::config::Config;
use rill::message::{Callback, Cookie};
use rill::types::Priority;

/// One delivery observed by a [`Collector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub timestamp: u64,
}

/// Subscriber that records every delivery it receives.
///
/// The callback is created once, so the same identity can be used for
/// subscribe, duplicate-subscribe and unsubscribe calls.
pub struct Collector {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    callback: Callback,
}

impl Collector {
    pub fn new() -> Self {
        let deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deliveries);
        let callback: Callback = Arc::new(move |view, _cookie| {
            sink.lock().unwrap().push(Delivery {
                topic: view.topic.to_string(),
                payload: view.payload.to_vec(),
                priority: view.priority,
                timestamp: view.timestamp,
            });
        });
        Self {
            deliveries,
            callback,
        }
    }

    pub fn callback(&self) -> Callback {
        Arc::clone(&self.callback)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.deliveries()
            .into_iter()
            .map(|delivery| delivery.payload)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// Poll until at least `want` deliveries arrived.
    pub async fn wait_for(&self, want: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count() >= want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count() >= want
    }
}

pub fn cookie() -> Cookie {
    Arc::new(())
}

pub fn test_bus() -> Bus {
    init_logger();
    Bus::new(Config::default()).unwrap()
}

/// Bus with a fast retry policy for the QoS tests.
pub fn fast_retry_bus(retry_count: u32, retry_interval_ms: u64) -> Bus {
    init_logger();
    let toml = format!(
        r#"
[overlay]
retry_count = {retry_count}
retry_interval_ms = {retry_interval_ms}
"#
    );
    Bus::new(Config::from_toml(&toml).unwrap()).unwrap()
}

/// Poll until the pool usage of `bus` drops back to `baseline`.
pub async fn wait_for_pool_baseline(bus: &Bus, baseline: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if bus.pool_stats().used == baseline {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bus.pool_stats().used == baseline
}

pub fn init_logger() {
    // Console-only config; a second init in the same binary is fine.
    let _ = rill::log::init_log(&rill::config::Log::default());
}
