//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum socket: a writer task drains the session's
//! [`QueuedOutbound`] into the socket while the caller watches the inbound
//! half for the client going away.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::queue::{QueuedOutbound, DEFAULT_QUEUE_CAPACITY};
use crate::traits::{Outbound, SessionId};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Frames a session may have waiting before deliveries are refused.
    pub queue_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Why a session's inbound side ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame.
    Closed,
    /// The stream ended without a close frame.
    Ended,
    /// The socket failed.
    Error(String),
}

/// A WebSocket client session.
pub struct WebSocketSession {
    outbound: Arc<QueuedOutbound>,
    receiver: SplitStream<WebSocket>,
    writer: JoinHandle<()>,
}

impl WebSocketSession {
    /// Take over an upgraded socket and start its writer task.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, config: &WebSocketConfig) -> Self {
        let id = SessionId::generate();
        let (sender, receiver) = socket.split();
        let (outbound, rx) = QueuedOutbound::channel(
            id,
            config.queue_capacity,
            remote_addr.map(|addr| addr.to_string()),
        );

        let writer = tokio::spawn(write_loop(Arc::clone(&outbound), sender, rx));

        Self {
            outbound,
            receiver,
            writer,
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        self.outbound.id()
    }

    /// Get the delivery handle to register with the relay.
    #[must_use]
    pub fn outbound(&self) -> Arc<dyn Outbound> {
        Arc::clone(&self.outbound) as Arc<dyn Outbound>
    }

    /// Read the inbound side until the client goes away.
    ///
    /// Client payloads carry no meaning for the relay and are dropped.
    pub async fn wait_closed(&mut self) -> CloseReason {
        let id = self.outbound.id().clone();

        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!(session = %id, bytes = text.len(), "Ignoring text message");
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(session = %id, bytes = data.len(), "Ignoring binary message");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // axum answers pings itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(session = %id, "Received close frame");
                    return CloseReason::Closed;
                }
                Some(Err(e)) => {
                    warn!(session = %id, error = %e, "WebSocket error");
                    return CloseReason::Error(e.to_string());
                }
                None => {
                    debug!(session = %id, "WebSocket stream ended");
                    return CloseReason::Ended;
                }
            }
        }
    }

    /// Stop the writer and mark the session closed.
    pub async fn shutdown(self) {
        self.outbound.close();
        self.writer.abort();
        let _ = self.writer.await;
        debug!(session = %self.outbound.id(), "WebSocket session shut down");
    }
}

/// Drain queued frames onto the socket in order.
async fn write_loop(
    outbound: Arc<QueuedOutbound>,
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<str>>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sender.send(Message::Text(frame.to_string())).await {
            debug!(session = %outbound.id(), error = %e, "Write failed, closing outbound");
            outbound.close();
            return;
        }
    }
}
