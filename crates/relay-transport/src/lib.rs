//! # relay-transport
//!
//! Delivery side of a client session for the telemetry relay.
//!
//! The relay core never touches sockets. It holds an [`Outbound`] handle per
//! session and hands it encoded frames; the transport decides how they reach
//! the wire.
//!
//! - **QueuedOutbound** - bounded per-session queue, FIFO, never blocks the
//!   broadcaster
//! - **WebSocket** - axum socket pump draining a queue into the socket
//!
//! ```rust,ignore
//! use relay_transport::{websocket::WebSocketSession, WebSocketConfig};
//!
//! async fn handle(socket: axum::extract::ws::WebSocket) {
//!     let session = WebSocketSession::new(socket, None, &WebSocketConfig::default());
//!     let outbound = session.outbound();
//!     // register `outbound` with the relay, then:
//!     let reason = session.wait_closed().await;
//! }
//! ```

pub mod queue;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use queue::QueuedOutbound;
pub use traits::{Outbound, SessionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{CloseReason, WebSocketConfig, WebSocketSession};
