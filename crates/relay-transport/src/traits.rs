//! Session delivery traits for the relay.
//!
//! These types define what the relay core needs from a connected client:
//! an identity and a way to hand it encoded frames without waiting on the
//! network.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Counter mixed into generated IDs so two sessions opened in the same
/// nanosecond still differ.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique session ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sess_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Session was closed.
    #[error("Session closed")]
    ConnectionClosed,

    /// The session's outbound queue is full.
    #[error("Outbound queue full ({0} frames)")]
    Backpressure(usize),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),
}

/// The delivery handle of one connected client.
///
/// `deliver` must never wait on the network: the broadcaster calls it for
/// every session in turn, and one slow client must not hold up the rest.
/// Frames handed to the same session are written in the order delivered.
pub trait Outbound: Send + Sync {
    /// Get the session's unique identifier.
    fn id(&self) -> &SessionId;

    /// Hand an encoded frame to the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or cannot accept more data.
    fn deliver(&self, frame: Arc<str>) -> Result<(), TransportError>;

    /// Check if the session is still open.
    fn is_open(&self) -> bool;

    /// Get the remote address of the client, if known.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
