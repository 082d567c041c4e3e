//! Frame types for the relay protocol.
//!
//! Both frames serialize to a bare JSON object keyed by channel name, so
//! clients can merge either kind into the same local table.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;

/// Field added to every update with the relay's receipt time (ms since epoch).
pub const RECEIPT_FIELD: &str = "ws_timestamp";

/// Field added to an update when the record carries a source timestamp.
pub const LATENCY_FIELD: &str = "latency_ms";

/// One entity's state as a JSON object.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Decoded frame contents: channel name to record, `None` for missing records.
pub type Entries = BTreeMap<String, Option<Record>>;

/// A frame sent from the relay to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Initial state of every tracked entity, sent to one new client.
    Snapshot(Entries),

    /// Fresh state of a single entity, broadcast to all clients.
    Update {
        /// Channel the change notification arrived on.
        channel: String,
        /// Stamped record.
        record: Record,
    },
}

impl Frame {
    /// Create a new Snapshot frame.
    #[must_use]
    pub fn snapshot(entries: Entries) -> Self {
        Frame::Snapshot(entries)
    }

    /// Create a new Update frame.
    #[must_use]
    pub fn update(channel: impl Into<String>, record: Record) -> Self {
        Frame::Update {
            channel: channel.into(),
            record,
        }
    }

    /// Number of entities carried by this frame.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Snapshot(entries) => entries.len(),
            Frame::Update { .. } => 1,
        }
    }

    /// Whether the frame carries no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short name for logs and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Snapshot(_) => "snapshot",
            Frame::Update { .. } => "update",
        }
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Frame::Snapshot(entries) => entries.serialize(serializer),
            Frame::Update { channel, record } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(channel, record)?;
                map.end()
            }
        }
    }
}
