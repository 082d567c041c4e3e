//! Contract consumed from the key-value / pub-sub backend.
//!
//! The relay only reads state and listens for change notifications. The
//! write side exists for producers, seeding and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection to the store is gone.
    #[error("Store connection lost: {0}")]
    ConnectionLost(String),

    /// A command failed.
    #[error("Store command failed: {0}")]
    Command(String),

    /// A reply could not be interpreted.
    #[error("Malformed store reply: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Whether the error means the connection itself is unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::ConnectionLost(_))
    }
}

/// A change notification received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw published payload. A change signal only; state is re-read.
    pub payload: Vec<u8>,
}

impl Notification {
    /// Create a new notification.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Key-value side of the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Members of the set at `key`; empty if the key does not exist.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Add a member to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All fields of the hash at `key`; empty if the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Set fields on the hash at `key`.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Publish a message on a channel, returning how many subscribers got it.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError>;
}

/// Pub/sub side of the store.
///
/// Implementations serialize `subscribe`/`unsubscribe` on the underlying
/// connection, and `next_message` must be cancel safe: dropping the future
/// before it resolves loses no message.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError>;

    /// Stop receiving messages published on `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError>;

    /// Wait for the next message on any subscribed channel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionLost`] once the stream has ended.
    async fn next_message(&self) -> Result<Notification, StoreError>;
}
