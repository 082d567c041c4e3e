//! Key space shared with the telemetry producers.
//!
//! Every entity has one store key that is both the hash holding its current
//! state and the pub/sub channel producers notify on:
//! `<prefix>:<id>:data`. The set of known ids lives at a separate key,
//! `info:batteries:ids` by default.

use std::fmt;

/// Default entity prefix.
pub const DEFAULT_PREFIX: &str = "battery";

/// Default key of the set holding every known entity id.
pub const DEFAULT_IDS_KEY: &str = "info:batteries:ids";

const DATA_SUFFIX: &str = "data";

/// Identifier of a telemetry source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new entity ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// A pub/sub channel name, also the key of the entity's state hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(String);

impl ChannelName {
    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the name, returning the underlying string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Naming scheme for one telemetry domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    ids_key: String,
}

impl KeySpace {
    /// Create a key space from an entity prefix and the key of the id set.
    #[must_use]
    pub fn new(prefix: impl Into<String>, ids_key: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ids_key: ids_key.into(),
        }
    }

    /// Entity prefix, e.g. `battery`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of the set listing every known entity id.
    #[must_use]
    pub fn ids_key(&self) -> &str {
        &self.ids_key
    }

    /// Channel (and state key) for an entity.
    #[must_use]
    pub fn channel(&self, id: &EntityId) -> ChannelName {
        ChannelName(format!("{}:{}:{}", self.prefix, id, DATA_SUFFIX))
    }

    /// Recover the entity behind a channel name.
    ///
    /// Returns `None` for names outside this key space.
    #[must_use]
    pub fn entity_id(&self, channel: &str) -> Option<EntityId> {
        let id = channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .strip_suffix(DATA_SUFFIX)?
            .strip_suffix(':')?;

        if id.is_empty() {
            None
        } else {
            Some(EntityId::new(id))
        }
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_IDS_KEY)
    }
}
