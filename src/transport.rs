// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Narrow surface of the external transport consumed by the bus.
//!
//! The broker protocol, device framing and network bring-up live behind
//! these capabilities, outside the core.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::Receiver;

use crate::error::Error;
use crate::overlay::ReliableOverlay;
use crate::types::MessageId;

/// Connection state reported by the external transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Callback observing transport state changes.
pub type StatusCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Byte-stream capability of the external transport. The bus treats it
/// as opaque; what the bytes mean is the bridge's business.
pub trait Transport: Send {
    /// Send a full buffer; resolves to the number of bytes written.
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Receive into `buf`; resolves to the number of bytes read.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, Error>> + Send;

    fn state(&self) -> ConnectionState;

    fn register_status_callback(&mut self, callback: StatusCallback);
}

/// A decoded acknowledgement arriving from the broker bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    pub topic: String,
    pub msg_id: MessageId,
}

/// Source of decoded acknowledgements. The framing that produces them
/// sits behind the [`Transport`], outside the core.
pub trait AckSource: Send {
    /// Next acknowledgement; `None` once the transport side closes.
    fn next_ack(&mut self) -> impl Future<Output = Option<AckEvent>> + Send;
}

impl AckSource for Receiver<AckEvent> {
    fn next_ack(&mut self) -> impl Future<Output = Option<AckEvent>> + Send {
        self.recv()
    }
}

/// Drains an [`AckSource`] into the pending-record set.
pub struct AckIngress<S> {
    source: S,
    overlay: Arc<ReliableOverlay>,
}

impl<S: AckSource> AckIngress<S> {
    pub(crate) fn new(source: S, overlay: Arc<ReliableOverlay>) -> Self {
        Self { source, overlay }
    }

    pub(crate) async fn run_loop(mut self) {
        while let Some(ack) = self.source.next_ack().await {
            if let Err(err) = self.overlay.acknowledge(&ack.topic, ack.msg_id) {
                log::warn!(
                    "ingress: unmatched ack for topic {} id {}: {}",
                    ack.topic,
                    ack.msg_id,
                    err
                );
            }
        }
        log::info!("ingress: ack source closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{AckEvent, AckSource, ConnectionState, StatusCallback, Transport};
    use crate::error::Error;

    /// In-memory loopback transport: everything sent is received back.
    struct LoopbackTransport {
        buffered: Vec<u8>,
        state: ConnectionState,
        status_callback: Option<StatusCallback>,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self {
                buffered: Vec::new(),
                state: ConnectionState::Connected,
                status_callback: None,
            }
        }

        fn set_state(&mut self, state: ConnectionState) {
            self.state = state;
            if let Some(callback) = &self.status_callback {
                callback(state);
            }
        }
    }

    impl Transport for LoopbackTransport {
        async fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
            self.buffered.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            let n = self.buffered.len().min(buf.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered.drain(..n);
            Ok(n)
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        fn register_status_callback(&mut self, callback: StatusCallback) {
            self.status_callback = Some(callback);
        }
    }

    #[tokio::test]
    async fn test_loopback_transport_round_trip() {
        let mut transport = LoopbackTransport::new();
        assert_eq!(transport.send(b"ack-frame").await.unwrap(), 9);

        let mut buf = [0_u8; 16];
        let n = transport.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ack-frame");
    }

    #[tokio::test]
    async fn test_status_callback_fires() {
        let mut transport = LoopbackTransport::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.register_status_callback(Arc::new(move |state| {
            sink.lock().unwrap().push(state);
        }));

        transport.set_state(ConnectionState::Disconnected);
        transport.set_state(ConnectionState::Connecting);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [ConnectionState::Disconnected, ConnectionState::Connecting]
        );
    }

    #[tokio::test]
    async fn test_channel_is_an_ack_source() {
        let (sender, mut receiver) = tokio::sync::mpsc::channel(4);
        sender
            .send(AckEvent {
                topic: "sensor/t".to_owned(),
                msg_id: 7,
            })
            .await
            .unwrap();
        drop(sender);

        let ack = receiver.next_ack().await.unwrap();
        assert_eq!(ack.topic, "sensor/t");
        assert_eq!(ack.msg_id, 7);
        assert!(receiver.next_ack().await.is_none());
    }
}
