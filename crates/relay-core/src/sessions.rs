//! The set of connected sessions and fan-out to them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_protocol::{codec, Frame, ProtocolError};
use relay_transport::{Outbound, SessionId, TransportError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Active sessions, readable by the broadcaster without the lifecycle lock.
#[derive(Default)]
pub struct SessionSet {
    sessions: DashMap<SessionId, Arc<dyn Outbound>>,
}

impl SessionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` if its ID was already present.
    pub fn insert(&self, session: Arc<dyn Outbound>) -> bool {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    /// Remove a session, returning it if it was present.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<dyn Outbound>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Check if a session is present.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no session is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Deliver a frame to every session present right now.
    ///
    /// A session that refuses the frame is logged and skipped; it stays in
    /// the set until it is disconnected. Returns the number of sessions
    /// that accepted the frame.
    ///
    /// # Errors
    ///
    /// Returns an error only if the frame cannot be encoded.
    pub fn broadcast(&self, frame: &Frame) -> Result<usize, ProtocolError> {
        let text: Arc<str> = Arc::from(codec::encode(frame)?);

        // Snapshot first so no shard lock is held while delivering.
        let targets: Vec<Arc<dyn Outbound>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for session in &targets {
            match session.deliver(Arc::clone(&text)) {
                Ok(()) => delivered += 1,
                Err(e) => log_delivery_failure(session.id(), &e),
            }
        }

        crate::metrics::record_delivered(frame.kind(), delivered);
        debug!(
            kind = frame.kind(),
            recipients = targets.len(),
            delivered,
            "Broadcast frame"
        );
        Ok(delivered)
    }
}

/// Log and count a frame a session refused.
pub(crate) fn log_delivery_failure(id: &SessionId, error: &TransportError) {
    crate::metrics::record_delivery_failure();
    warn!(session = %id, error = %error, "Delivery failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::Record;
    use relay_transport::QueuedOutbound;
    use serde_json::json;

    fn update() -> Frame {
        let mut record = Record::new();
        record.insert("voltage".into(), json!(42));
        Frame::update("battery:7:data", record)
    }

    #[test]
    fn test_insert_rejects_duplicate_ids() {
        let set = SessionSet::new();
        let (a, _rx) = QueuedOutbound::channel("s1".into(), 4, None);

        assert!(set.insert(a.clone()));
        assert!(!set.insert(a));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let set = SessionSet::new();
        let (a, mut rx_a) = QueuedOutbound::channel("s1".into(), 4, None);
        let (b, mut rx_b) = QueuedOutbound::channel("s2".into(), 4, None);
        set.insert(a);
        set.insert(b);

        assert_eq!(set.broadcast(&update()).unwrap(), 2);

        let expected = r#"{"battery:7:data":{"voltage":42}}"#;
        assert_eq!(&*rx_a.recv().await.unwrap(), expected);
        assert_eq!(&*rx_b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_others_and_session() {
        let set = SessionSet::new();
        let (dead, dead_rx) = QueuedOutbound::channel("dead".into(), 4, None);
        let (live, mut live_rx) = QueuedOutbound::channel("live".into(), 4, None);
        drop(dead_rx);
        set.insert(dead);
        set.insert(live);

        assert_eq!(set.broadcast(&update()).unwrap(), 1);
        assert!(live_rx.recv().await.is_some());
        assert!(set.contains(&SessionId::from("dead")));
        assert_eq!(set.len(), 2);
    }
}
