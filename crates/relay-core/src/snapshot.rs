//! Reading entity state from the store.

use relay_protocol::{Record, LATENCY_FIELD, RECEIPT_FIELD};
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::keys::{EntityId, KeySpace};
use crate::store::{Store, StoreError};

/// Default name of the field producers write their own timestamp to.
pub const DEFAULT_TIMESTAMP_FIELD: &str = "timestamp";

/// Current UTC time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Current state of one entity, as read from its hash.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    fields: Record,
}

impl EntitySnapshot {
    /// Build a snapshot from raw hash fields.
    ///
    /// Returns `None` for an empty hash, which is how the store reports a
    /// missing key. Numeric strings become JSON numbers.
    #[must_use]
    pub fn from_hash(hash: HashMap<String, String>) -> Option<Self> {
        if hash.is_empty() {
            return None;
        }

        let fields = hash
            .into_iter()
            .map(|(field, value)| (field, coerce(value)))
            .collect();

        Some(Self { fields })
    }

    /// Get a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the snapshot has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The producer's timestamp in ms, if the field holds a number.
    #[must_use]
    pub fn source_timestamp(&self, field: &str) -> Option<i64> {
        match self.fields.get(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    /// Add `ws_timestamp`, and `latency_ms` when a source timestamp is
    /// present, returning the record to send.
    #[must_use]
    pub fn stamp(self, received_at: i64, timestamp_field: &str) -> Record {
        let latency = self
            .source_timestamp(timestamp_field)
            .map(|sent_at| received_at.saturating_sub(sent_at));

        let mut record = self.fields;
        record.insert(RECEIPT_FIELD.to_string(), Value::from(received_at));
        if let Some(latency) = latency {
            record.insert(LATENCY_FIELD.to_string(), Value::from(latency));
        }
        record
    }

    /// The unstamped record.
    #[must_use]
    pub fn into_record(self) -> Record {
        self.fields
    }
}

/// Turn a hash value into a JSON number when it is written in canonical
/// form, so the number prints back as the same text. Anything else
/// (`"007"`, `"+5"`, integers beyond i64) stays a string.
fn coerce(value: String) -> Value {
    if let Ok(n) = value.parse::<i64>() {
        if n.to_string() == value {
            return Value::from(n);
        }
        return Value::String(value);
    }
    if let Some(n) = value
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
        .filter(|n| n.to_string() == value)
    {
        return Value::Number(n);
    }
    Value::String(value)
}

/// Reads entity state from the store.
#[derive(Clone)]
pub struct SnapshotReader {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl SnapshotReader {
    /// Create a new reader.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Get the key space.
    #[must_use]
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Every entity id currently registered in the store, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the id set cannot be read.
    pub async fn known_ids(&self) -> Result<Vec<EntityId>, StoreError> {
        let mut ids: Vec<EntityId> = self
            .store
            .set_members(self.keys.ids_key())
            .await?
            .into_iter()
            .map(EntityId::from)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Read one entity's current state; `None` if it has no record.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn read_one(&self, id: &EntityId) -> Result<Option<EntitySnapshot>, StoreError> {
        let channel = self.keys.channel(id);
        let hash = self.store.hash_get_all(channel.as_str()).await?;
        Ok(EntitySnapshot::from_hash(hash))
    }

    /// Read every listed entity.
    ///
    /// A missing record or a failed read of one entity yields `None` for
    /// that entity only.
    ///
    /// # Errors
    ///
    /// Returns an error only if the connection to the store is lost.
    pub async fn read_all(
        &self,
        ids: &[EntityId],
    ) -> Result<BTreeMap<EntityId, Option<EntitySnapshot>>, StoreError> {
        let mut snapshots = BTreeMap::new();

        for id in ids {
            let snapshot = match self.read_one(id).await {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(entity = %id, error = %e, "Snapshot read failed, sending empty");
                    None
                }
            };
            if snapshot.is_none() {
                debug!(entity = %id, "No record for entity");
            }
            snapshots.insert(id.clone(), snapshot);
        }

        Ok(snapshots)
    }
}
