// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Fault reporting: a severity ladder drained by a dedicated task.
//!
//! Fatal events terminate the process after a short grace delay; all
//! other levels are informational or recoverable.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::error::ErrorKind;
use crate::types::Clock;

const FAULT_QUEUE_SIZE: usize = 20;

/// Severity ladder for fault events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// A reported fault.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,

    /// Clock microseconds at report time.
    pub timestamp: u64,
}

/// Callback invoked for every drained fault event.
pub type FaultCallback = Arc<dyn Fn(&FaultEvent) + Send + Sync>;

type SharedCallback = Arc<Mutex<Option<FaultCallback>>>;

/// Cloneable handle for reporting faults from any task context.
///
/// Reporting never blocks: a full fault queue drops the event with an
/// error log.
#[derive(Clone)]
pub struct FaultHandle {
    sender: Sender<FaultEvent>,
    callback: SharedCallback,
    clock: Clock,
}

impl std::fmt::Debug for FaultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHandle").finish_non_exhaustive()
    }
}

impl FaultHandle {
    pub fn report(&self, severity: Severity, kind: ErrorKind, message: String) {
        let event = FaultEvent {
            severity,
            kind,
            message,
            timestamp: self.clock.now_micros(),
        };
        if self.sender.try_send(event).is_err() {
            log::error!("fault: queue full, event dropped");
        }
    }

    /// Register a callback observing every fault event.
    pub fn set_callback(&self, callback: FaultCallback) {
        let mut slot = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(callback);
    }
}

/// The fault drain task.
pub struct FaultApp {
    receiver: Receiver<FaultEvent>,
    callback: SharedCallback,
    grace: Duration,
}

impl FaultApp {
    pub async fn run_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            match event.severity {
                Severity::Info => {
                    log::info!("fault: [{:?}] {}", event.kind, event.message);
                }
                Severity::Warning => {
                    log::warn!("fault: [{:?}] {}", event.kind, event.message);
                }
                Severity::Error | Severity::Fatal => {
                    log::error!("fault: [{:?}] {}", event.kind, event.message);
                }
            }

            let callback = self
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback(&event);
            }

            if event.severity == Severity::Fatal {
                log::error!("fault: fatal error occurred, terminating process");
                tokio::time::sleep(self.grace).await;
                std::process::exit(1);
            }
        }
    }
}

/// Start the fault task and hand back the reporting handle.
///
/// Must be called within a tokio runtime.
#[must_use]
pub fn spawn(grace: Duration, clock: Clock) -> FaultHandle {
    let (sender, receiver) = mpsc::channel(FAULT_QUEUE_SIZE);
    let callback: SharedCallback = Arc::new(Mutex::new(None));
    let app = FaultApp {
        receiver,
        callback: Arc::clone(&callback),
        grace,
    };
    tokio::spawn(app.run_loop());
    FaultHandle {
        sender,
        callback,
        clock,
    }
}
