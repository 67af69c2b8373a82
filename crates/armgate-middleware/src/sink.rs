//! The connection sink seam.
//!
//! The bus never speaks to a socket directly.  Each subscribed connection
//! hands it a [`ConnectionSink`]; the connection's drain task owns the sink
//! and writes serialized envelopes into it one at a time.
//!
//! - [`WsSink`] – the write half of a WebSocket.
//! - [`ChannelSink`] – an in-process sink backed by an unbounded channel,
//!   used by the operator console and in tests.

use std::fmt::Display;

use armgate_types::ArmError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Destination of one observer connection.
///
/// # Contract
///
/// * `send_text` – deliver one JSON frame.  An `Err` means the connection is
///   unusable; the bus tears it down and never calls the sink again.
/// * `close` – best-effort shutdown once the connection leaves the bus.
#[async_trait]
pub trait ConnectionSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ArmError>;

    async fn close(&mut self) {}
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket
// ────────────────────────────────────────────────────────────────────────────

/// Adapts any tungstenite message sink (typically the `SplitSink` of an
/// accepted WebSocket) to [`ConnectionSink`].
pub struct WsSink<S> {
    inner: S,
}

impl<S> WsSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> ConnectionSink for WsSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    async fn send_text(&mut self, text: String) -> Result<(), ArmError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ArmError::Delivery(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-process channel
// ────────────────────────────────────────────────────────────────────────────

/// Sink whose frames land in an [`mpsc::UnboundedReceiver`].  Dropping the
/// receiver makes the next send fail, like a closed socket.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), ArmError> {
        self.tx
            .send(text)
            .map_err(|_| ArmError::Delivery("receiver dropped".into()))
    }
}
