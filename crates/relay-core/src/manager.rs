//! Session lifecycle for the relay.
//!
//! [`Relay`] owns the active sessions, the subscription registry and the
//! broadcast listener. Connects and disconnects are serialized by one
//! lifecycle lock that is held across their store calls, so reference
//! counts never lose updates. The listener never takes that lock; it only
//! reads the session set.

use relay_protocol::{codec, Entries, Frame, ProtocolError};
use relay_transport::{Outbound, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::keys::{ChannelName, KeySpace};
use crate::listener::{ListenerContext, ListenerHandle, ListenerState};
use crate::registry::SubscriptionRegistry;
use crate::sessions::{log_delivery_failure, SessionSet};
use crate::snapshot::{EntitySnapshot, SnapshotReader, DEFAULT_TIMESTAMP_FIELD};
use crate::store::{PubSub, Store, StoreError};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A frame could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Naming scheme of the telemetry domain.
    pub keys: KeySpace,
    /// Hash field holding the producer's own timestamp (ms).
    pub timestamp_field: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keys: KeySpace::default(),
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
        }
    }
}

/// State guarded by the lifecycle lock.
#[derive(Default)]
struct Lifecycle {
    registry: SubscriptionRegistry,
    /// Channels acquired on behalf of each session, released on disconnect.
    interests: HashMap<SessionId, Vec<ChannelName>>,
    listener: Option<ListenerHandle>,
}

/// The telemetry relay.
pub struct Relay {
    pubsub: Arc<dyn PubSub>,
    reader: SnapshotReader,
    sessions: Arc<SessionSet>,
    lifecycle: Mutex<Lifecycle>,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay over a store and its pub/sub side.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, pubsub: Arc<dyn PubSub>, config: RelayConfig) -> Self {
        info!(
            prefix = config.keys.prefix(),
            ids_key = config.keys.ids_key(),
            "Creating relay"
        );
        Self {
            pubsub,
            reader: SnapshotReader::new(store, config.keys.clone()),
            sessions: Arc::new(SessionSet::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            config,
        }
    }

    /// Get the relay configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a session.
    ///
    /// The session receives a snapshot of every known entity, subscriptions
    /// for those entities are acquired on its behalf, and the listener is
    /// started if it is not running. The session only joins the broadcast
    /// set once its snapshot is queued, so no live update can overtake it.
    /// Connecting an already connected session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or subscribed to; the
    /// session is then not registered and holds no subscriptions.
    pub async fn connect(&self, session: Arc<dyn Outbound>) -> Result<(), RelayError> {
        let mut life = self.lifecycle.lock().await;
        let id = session.id().clone();

        // Sessions are only inserted under the lifecycle lock.
        if self.sessions.contains(&id) {
            warn!(session = %id, "Session already connected");
            return Ok(());
        }

        let channels = match self.seed(&mut life, session.as_ref()).await {
            Ok(channels) => channels,
            Err(e) => {
                error!(session = %id, error = %e, "Failed to set up session");
                return Err(e);
            }
        };

        self.sessions.insert(Arc::clone(&session));
        life.interests.insert(id.clone(), channels);
        info!(
            session = %id,
            remote = session.remote_addr().as_deref().unwrap_or("-"),
            sessions = self.sessions.len(),
            "Client connected"
        );
        crate::metrics::record_session_connected(self.sessions.len());

        self.ensure_listener(&mut life).await;
        Ok(())
    }

    /// Send the initial snapshot and acquire the session's subscriptions.
    async fn seed(
        &self,
        life: &mut Lifecycle,
        session: &dyn Outbound,
    ) -> Result<Vec<ChannelName>, RelayError> {
        let ids = self.reader.known_ids().await?;
        let snapshots = self.reader.read_all(&ids).await?;

        let entries: Entries = snapshots
            .into_iter()
            .map(|(id, snapshot)| {
                (
                    self.config.keys.channel(&id).into_string(),
                    snapshot.map(EntitySnapshot::into_record),
                )
            })
            .collect();
        let frame = Frame::snapshot(entries);
        let text = codec::encode(&frame)?;

        match session.deliver(Arc::from(text)) {
            Ok(()) => {
                crate::metrics::record_delivered(frame.kind(), 1);
                debug!(session = %session.id(), entities = frame.len(), "Sent initial snapshot");
            }
            Err(e) => log_delivery_failure(session.id(), &e),
        }

        let channels: Vec<ChannelName> = ids.iter().map(|id| self.config.keys.channel(id)).collect();
        life.registry.acquire(self.pubsub.as_ref(), &channels).await?;
        Ok(channels)
    }

    /// Start the listener unless one is running, replacing a failed one.
    async fn ensure_listener(&self, life: &mut Lifecycle) {
        if let Some(handle) = life.listener.take() {
            if !handle.is_finished() {
                life.listener = Some(handle);
                return;
            }
            if let Err(e) = handle.stop().await {
                warn!(error = %e, "Restarting failed broadcast listener");
            }
        }

        life.listener = Some(ListenerHandle::spawn(ListenerContext {
            pubsub: Arc::clone(&self.pubsub),
            reader: self.reader.clone(),
            sessions: Arc::clone(&self.sessions),
            timestamp_field: self.config.timestamp_field.clone(),
        }));
    }

    /// Remove a session.
    ///
    /// Releases the subscriptions acquired for it and, if it was the last
    /// session, stops the listener and waits for it to exit. Unknown
    /// sessions are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if an unsubscribe failed. The session is removed
    /// regardless.
    pub async fn disconnect(&self, id: &SessionId) -> Result<(), RelayError> {
        let mut life = self.lifecycle.lock().await;

        if self.sessions.remove(id).is_none() {
            debug!(session = %id, "Disconnect of unknown session ignored");
            return Ok(());
        }
        info!(session = %id, sessions = self.sessions.len(), "Client disconnected");
        crate::metrics::record_session_disconnected(self.sessions.len());

        let channels = life.interests.remove(id).unwrap_or_default();
        let released = life.registry.release(self.pubsub.as_ref(), &channels).await;

        if self.sessions.is_empty() {
            if let Some(handle) = life.listener.take() {
                match handle.stop().await {
                    Ok(()) => info!("Broadcast listener stopped"),
                    Err(e) => warn!(error = %e, "Broadcast listener had failed before stop"),
                }
            }
        }

        released.map_err(RelayError::from)
    }

    /// Deliver a frame to every connected session.
    ///
    /// Returns how many sessions accepted it; a session that refuses is
    /// logged and stays connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded.
    pub fn broadcast(&self, frame: &Frame) -> Result<usize, RelayError> {
        Ok(self.sessions.broadcast(frame)?)
    }

    /// Drop every session, release all subscriptions and stop the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if an unsubscribe failed.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let mut life = self.lifecycle.lock().await;

        let ids: Vec<SessionId> = life.interests.keys().cloned().collect();
        for id in &ids {
            self.sessions.remove(id);
        }
        life.interests.clear();
        crate::metrics::record_session_disconnected(self.sessions.len());

        if let Some(handle) = life.listener.take() {
            if let Err(e) = handle.stop().await {
                warn!(error = %e, "Broadcast listener had failed before shutdown");
            }
        }

        let cleared = life.registry.clear(self.pubsub.as_ref()).await;
        info!(sessions = ids.len(), "Relay shut down");
        cleared.map_err(RelayError::from)
    }

    /// Number of connected sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Check if a session is connected.
    #[must_use]
    pub fn is_connected(&self, id: &SessionId) -> bool {
        self.sessions.contains(id)
    }

    /// Current listener state.
    pub async fn listener_state(&self) -> ListenerState {
        match &self.lifecycle.lock().await.listener {
            None => ListenerState::Stopped,
            Some(handle) if handle.is_finished() => ListenerState::Failed,
            Some(_) => ListenerState::Running,
        }
    }

    /// How many sessions hold a channel.
    pub async fn subscription_count(&self, channel: &ChannelName) -> usize {
        self.lifecycle.lock().await.registry.count(channel)
    }

    /// Every channel currently subscribed at the store.
    pub async fn subscribed_channels(&self) -> Vec<ChannelName> {
        self.lifecycle.lock().await.registry.channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::EntityId;
    use crate::memory::MemoryStore;
    use crate::store::Notification;
    use relay_transport::QueuedOutbound;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn channel(id: u64) -> ChannelName {
        KeySpace::default().channel(&EntityId::from(id))
    }

    async fn seeded_store(ids: &[u64]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store
                .set_add("info:batteries:ids", &id.to_string())
                .await
                .unwrap();
            store
                .hash_set(
                    &format!("battery:{id}:data"),
                    &[
                        ("timestamp".to_string(), "1000".to_string()),
                        ("voltage".to_string(), "42".to_string()),
                    ],
                )
                .await
                .unwrap();
        }
        store
    }

    fn relay(store: &Arc<MemoryStore>) -> Relay {
        Relay::new(store.clone(), store.clone(), RelayConfig::default())
    }

    fn session(id: &str) -> (Arc<QueuedOutbound>, mpsc::Receiver<Arc<str>>) {
        QueuedOutbound::channel(id.into(), 64, None)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        let text = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no frame within 5s")
            .expect("queue closed");
        serde_json::from_str(&text).unwrap()
    }

    async fn assert_listener_matches_sessions(relay: &Relay) {
        let state = relay.listener_state().await;
        if relay.session_count() > 0 {
            assert_eq!(state, ListenerState::Running);
        } else {
            assert_eq!(state, ListenerState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_idle_relay_holds_nothing() {
        let store = seeded_store(&[7]).await;
        let relay = relay(&store);

        assert_eq!(relay.session_count(), 0);
        assert!(relay.subscribed_channels().await.is_empty());
        assert_eq!(relay.listener_state().await, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_single_session_lifecycle() {
        let store = seeded_store(&[7]).await;
        let relay = relay(&store);
        let (s1, mut rx) = session("s1");

        relay.connect(s1.clone()).await.unwrap();

        assert_eq!(relay.listener_state().await, ListenerState::Running);
        assert_eq!(relay.subscription_count(&channel(7)).await, 1);
        assert!(store.is_subscribed("battery:7:data"));

        let initial = next_frame(&mut rx).await;
        assert_eq!(initial["battery:7:data"]["voltage"], 42);
        assert!(initial["battery:7:data"].get("ws_timestamp").is_none());
        assert!(rx.try_recv().is_err());

        relay.disconnect(s1.id()).await.unwrap();

        assert_eq!(relay.subscription_count(&channel(7)).await, 0);
        assert!(!store.is_subscribed("battery:7:data"));
        assert_eq!(store.unsubscribe_calls("battery:7:data"), 1);
        assert_eq!(relay.listener_state().await, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_overlapping_sessions_share_subscription() {
        let store = seeded_store(&[7]).await;
        let relay = Arc::new(relay(&store));
        let (s1, _rx1) = session("s1");
        let (s2, _rx2) = session("s2");

        let (a, b) = tokio::join!(relay.connect(s1.clone()), relay.connect(s2.clone()));
        a.unwrap();
        b.unwrap();
        assert_eq!(relay.subscription_count(&channel(7)).await, 2);

        relay.disconnect(s1.id()).await.unwrap();
        assert_eq!(relay.subscription_count(&channel(7)).await, 1);
        assert!(store.is_subscribed("battery:7:data"));
        assert_listener_matches_sessions(&relay).await;

        relay.disconnect(s2.id()).await.unwrap();
        assert_eq!(relay.subscription_count(&channel(7)).await, 0);
        assert!(!store.is_subscribed("battery:7:data"));
        assert_eq!(store.unsubscribe_calls("battery:7:data"), 1);
        assert_listener_matches_sessions(&relay).await;
    }

    #[tokio::test]
    async fn test_unknown_disconnect_is_noop() {
        let store = seeded_store(&[7]).await;
        let relay = relay(&store);
        let (s1, _rx) = session("s1");
        relay.connect(s1).await.unwrap();

        relay.disconnect(&SessionId::from("ghost")).await.unwrap();

        assert_eq!(relay.session_count(), 1);
        assert_eq!(relay.subscription_count(&channel(7)).await, 1);
        assert_eq!(relay.listener_state().await, ListenerState::Running);
    }

    #[tokio::test]
    async fn test_double_disconnect_does_not_underflow() {
        let store = seeded_store(&[7]).await;
        let relay = relay(&store);
        let (s1, _rx1) = session("s1");
        let (s2, _rx2) = session("s2");
        relay.connect(s1.clone()).await.unwrap();
        relay.connect(s2).await.unwrap();

        relay.disconnect(s1.id()).await.unwrap();
        relay.disconnect(s1.id()).await.unwrap();

        assert_eq!(relay.subscription_count(&channel(7)).await, 1);
        assert!(store.is_subscribed("battery:7:data"));
    }

    #[tokio::test]
    async fn test_listener_tracks_sessions_through_sequence() {
        let store = seeded_store(&[1, 2]).await;
        let relay = relay(&store);
        let sessions: Vec<_> = (0..3).map(|i| session(&format!("s{i}"))).collect();

        for (s, _) in &sessions {
            relay.connect(s.clone()).await.unwrap();
            assert_listener_matches_sessions(&relay).await;
        }
        for (s, _) in sessions.iter().rev() {
            relay.disconnect(s.id()).await.unwrap();
            assert_listener_matches_sessions(&relay).await;
        }
        relay.connect(sessions[0].0.clone()).await.unwrap();
        assert_listener_matches_sessions(&relay).await;
        assert_eq!(relay.subscription_count(&channel(1)).await, 1);
    }

    #[tokio::test]
    async fn test_update_reaches_all_sessions() {
        let store = seeded_store(&[7]).await;
        let relay = relay(&store);
        let (s1, mut rx1) = session("s1");
        let (s2, mut rx2) = session("s2");
        relay.connect(s1).await.unwrap();
        relay.connect(s2).await.unwrap();
        next_frame(&mut rx1).await;
        next_frame(&mut rx2).await;

        store.publish("battery:7:data", b"tick").await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let update = next_frame(rx).await;
            let record = &update["battery:7:data"];
            assert_eq!(record["voltage"], 42);
            let received = record["ws_timestamp"].as_i64().unwrap();
            assert_eq!(record["latency_ms"].as_i64().unwrap(), received - 1000);
        }
    }

    #[tokio::test]
    async fn test_snapshot_precedes_live_updates() {
        let store = seeded_store(&[1, 2, 3]).await;
        let relay = Arc::new(relay(&store));
        let (s1, mut rx1) = session("s1");
        relay.connect(s1).await.unwrap();
        next_frame(&mut rx1).await;

        store.delay_reads(Duration::from_millis(100));
        let reads_before = store.reads_started();
        let (s2, mut rx2) = session("s2");
        let connecting = tokio::spawn({
            let relay = Arc::clone(&relay);
            async move { relay.connect(s2).await }
        });

        timeout(Duration::from_secs(5), async {
            while store.reads_started() == reads_before {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("snapshot read never started");
        store.publish("battery:1:data", b"tick").await.unwrap();

        let update = next_frame(&mut rx1).await;
        assert!(update["battery:1:data"].get("ws_timestamp").is_some());
        connecting.await.unwrap().unwrap();

        let first = next_frame(&mut rx2).await;
        assert_eq!(first.as_object().unwrap().len(), 3);
        for id in 1..=3 {
            let record = &first[format!("battery:{id}:data")];
            assert_eq!(record["voltage"], 42);
            assert!(record.get("ws_timestamp").is_none());
        }
    }

    #[tokio::test]
    async fn test_snapshot_marks_missing_entities_null() {
        let store = seeded_store(&[1]).await;
        store.set_add("info:batteries:ids", "9").await.unwrap();
        let relay = relay(&store);
        let (s1, mut rx) = session("s1");

        relay.connect(s1).await.unwrap();

        let initial = next_frame(&mut rx).await;
        assert_eq!(initial["battery:1:data"]["voltage"], 42);
        assert!(initial["battery:9:data"].is_null());
        assert_eq!(relay.subscription_count(&channel(9)).await, 1);
    }

    #[tokio::test]
    async fn test_connect_fails_when_store_lost() {
        let store = seeded_store(&[7]).await;
        let relay = relay(&store);
        store.sever();
        let (s1, _rx) = session("s1");

        assert!(matches!(
            relay.connect(s1.clone()).await,
            Err(RelayError::Store(StoreError::ConnectionLost(_)))
        ));
        assert!(!relay.is_connected(s1.id()));
        assert!(relay.subscribed_channels().await.is_empty());
        assert_eq!(relay.listener_state().await, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_listener_failure_is_visible_and_recovers() {
        let store = seeded_store(&[7]).await;
        let pubsub = Arc::new(FlakyStream::default());
        let relay = Relay::new(store.clone(), pubsub.clone(), RelayConfig::default());
        let (s1, _rx1) = session("s1");
        relay.connect(s1).await.unwrap();

        pubsub.end_stream();
        timeout(Duration::from_secs(5), async {
            while relay.listener_state().await != ListenerState::Failed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener never reported failure");

        pubsub.restore_stream();
        let (s2, _rx2) = session("s2");
        relay.connect(s2).await.unwrap();
        assert_eq!(relay.listener_state().await, ListenerState::Running);
    }

    /// Pub/sub whose message stream can be ended and restored.
    #[derive(Default)]
    struct FlakyStream {
        inner: MemoryStore,
        ended: AtomicBool,
    }

    impl FlakyStream {
        fn end_stream(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }

        fn restore_stream(&self) {
            self.ended.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl PubSub for FlakyStream {
        async fn subscribe(&self, channel: &str) -> Result<(), StoreError> {
            self.inner.subscribe(channel).await
        }

        async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
            self.inner.unsubscribe(channel).await
        }

        async fn next_message(&self) -> Result<Notification, StoreError> {
            loop {
                if self.ended.load(Ordering::SeqCst) {
                    return Err(StoreError::ConnectionLost("stream ended".into()));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let store = seeded_store(&[1, 2]).await;
        let relay = relay(&store);
        let (s1, _rx1) = session("s1");
        let (s2, _rx2) = session("s2");
        relay.connect(s1).await.unwrap();
        relay.connect(s2).await.unwrap();

        relay.shutdown().await.unwrap();

        assert_eq!(relay.session_count(), 0);
        assert!(relay.subscribed_channels().await.is_empty());
        assert!(!store.is_subscribed("battery:1:data"));
        assert_eq!(relay.listener_state().await, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_manual_broadcast_skips_dead_session() {
        let store = seeded_store(&[7]).await;
        let relay = relay(&store);
        let (s1, rx1) = session("s1");
        let (s2, mut rx2) = session("s2");
        relay.connect(s1.clone()).await.unwrap();
        relay.connect(s2).await.unwrap();
        next_frame(&mut rx2).await;
        drop(rx1);

        let delivered = relay.broadcast(&Frame::snapshot(Entries::new())).unwrap();

        assert_eq!(delivered, 1);
        assert!(relay.is_connected(s1.id()));
        assert_eq!(next_frame(&mut rx2).await, serde_json::json!({}));
    }
}
