//! Reference-counted channel subscriptions.
//!
//! A channel stays subscribed at the store for as long as at least one
//! session needs it. The registry issues exactly one `subscribe` per 0→1
//! transition and one `unsubscribe` per transition back to 0.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::keys::ChannelName;
use crate::store::{PubSub, StoreError};

/// Per-channel session counts.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    counts: HashMap<ChannelName, usize>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more holder for each channel, subscribing channels that
    /// had none.
    ///
    /// All or nothing: if a subscribe fails, the counts taken by this call
    /// are released again before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the store error of the failed subscribe.
    pub async fn acquire(
        &mut self,
        pubsub: &dyn PubSub,
        channels: &[ChannelName],
    ) -> Result<(), StoreError> {
        for (done, channel) in channels.iter().enumerate() {
            if let Err(e) = self.acquire_one(pubsub, channel).await {
                if let Err(rollback) = self.release(pubsub, &channels[..done]).await {
                    warn!(error = %rollback, "Rollback after failed subscribe also failed");
                }
                return Err(e);
            }
        }
        crate::metrics::set_subscribed_channels(self.counts.len());
        Ok(())
    }

    async fn acquire_one(
        &mut self,
        pubsub: &dyn PubSub,
        channel: &ChannelName,
    ) -> Result<(), StoreError> {
        let count = self.counts.get(channel).copied().unwrap_or(0);

        if count == 0 {
            pubsub.subscribe(channel.as_str()).await?;
        }
        self.counts.insert(channel.clone(), count + 1);

        info!(channel = %channel, count = count + 1, "Subscribed");
        Ok(())
    }

    /// Drop one holder for each channel, unsubscribing channels left with
    /// none.
    ///
    /// Releasing a channel that has no holders is clamped: logged, and no
    /// unsubscribe is issued. Every channel is processed even if an
    /// unsubscribe fails.
    ///
    /// # Errors
    ///
    /// Returns the first unsubscribe error.
    pub async fn release(
        &mut self,
        pubsub: &dyn PubSub,
        channels: &[ChannelName],
    ) -> Result<(), StoreError> {
        let mut first_error = None;

        for channel in channels {
            let Some(count) = self.counts.get_mut(channel) else {
                warn!(channel = %channel, "Release of channel with no holders, clamped at 0");
                continue;
            };

            *count -= 1;
            let remaining = *count;

            if remaining == 0 {
                self.counts.remove(channel);
                if let Err(e) = pubsub.unsubscribe(channel.as_str()).await {
                    warn!(channel = %channel, error = %e, "Unsubscribe failed");
                    first_error.get_or_insert(e);
                    continue;
                }
            }

            info!(channel = %channel, count = remaining, "Unsubscribed");
        }

        crate::metrics::set_subscribed_channels(self.counts.len());
        first_error.map_or(Ok(()), Err)
    }

    /// Current holder count of a channel.
    #[must_use]
    pub fn count(&self, channel: &ChannelName) -> usize {
        self.counts.get(channel).copied().unwrap_or(0)
    }

    /// Every channel with at least one holder, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelName> {
        let mut channels: Vec<_> = self.counts.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Check if no channel is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Forget every count, unsubscribing all held channels.
    ///
    /// # Errors
    ///
    /// Returns the first unsubscribe error.
    pub async fn clear(&mut self, pubsub: &dyn PubSub) -> Result<(), StoreError> {
        let channels = self.channels();
        debug!(channels = channels.len(), "Clearing subscriptions");

        let mut first_error = None;
        for channel in channels {
            self.counts.remove(&channel);
            if let Err(e) = pubsub.unsubscribe(channel.as_str()).await {
                first_error.get_or_insert(e);
            }
        }

        crate::metrics::set_subscribed_channels(0);
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{EntityId, KeySpace};
    use crate::memory::{MemoryStore, PubSubCall};
    use crate::store::Notification;
    use async_trait::async_trait;

    fn channels(ids: &[u64]) -> Vec<ChannelName> {
        let keys = KeySpace::default();
        ids.iter().map(|id| keys.channel(&EntityId::from(*id))).collect()
    }

    #[tokio::test]
    async fn test_subscribe_on_first_holder_only() {
        let store = MemoryStore::new();
        let mut registry = SubscriptionRegistry::new();
        let seven = channels(&[7]);

        registry.acquire(&store, &seven).await.unwrap();
        registry.acquire(&store, &seven).await.unwrap();

        assert_eq!(registry.count(&seven[0]), 2);
        assert_eq!(
            store.calls(),
            vec![PubSubCall::Subscribe("battery:7:data".into())]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_on_last_release_only() {
        let store = MemoryStore::new();
        let mut registry = SubscriptionRegistry::new();
        let seven = channels(&[7]);

        registry.acquire(&store, &seven).await.unwrap();
        registry.acquire(&store, &seven).await.unwrap();

        registry.release(&store, &seven).await.unwrap();
        assert_eq!(registry.count(&seven[0]), 1);
        assert!(store.is_subscribed("battery:7:data"));

        registry.release(&store, &seven).await.unwrap();
        assert_eq!(registry.count(&seven[0]), 0);
        assert!(registry.is_empty());
        assert!(!store.is_subscribed("battery:7:data"));
        assert_eq!(store.unsubscribe_calls("battery:7:data"), 1);
    }

    #[tokio::test]
    async fn test_release_below_zero_is_clamped() {
        let store = MemoryStore::new();
        let mut registry = SubscriptionRegistry::new();
        let seven = channels(&[7]);

        registry.acquire(&store, &seven).await.unwrap();
        registry.release(&store, &seven).await.unwrap();
        registry.release(&store, &seven).await.unwrap();

        assert_eq!(registry.count(&seven[0]), 0);
        assert_eq!(store.unsubscribe_calls("battery:7:data"), 1);
    }

    #[tokio::test]
    async fn test_clear_unsubscribes_everything() {
        let store = MemoryStore::new();
        let mut registry = SubscriptionRegistry::new();

        registry.acquire(&store, &channels(&[1, 2])).await.unwrap();
        registry.acquire(&store, &channels(&[2])).await.unwrap();
        registry.clear(&store).await.unwrap();

        assert!(registry.is_empty());
        assert!(!store.is_subscribed("battery:1:data"));
        assert!(!store.is_subscribed("battery:2:data"));
    }

    /// Refuses to subscribe to one channel.
    struct Refusing {
        inner: MemoryStore,
        refuse: &'static str,
    }

    #[async_trait]
    impl PubSub for Refusing {
        async fn subscribe(&self, channel: &str) -> Result<(), StoreError> {
            if channel == self.refuse {
                return Err(StoreError::Command("refused".into()));
            }
            self.inner.subscribe(channel).await
        }

        async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
            self.inner.unsubscribe(channel).await
        }

        async fn next_message(&self) -> Result<Notification, StoreError> {
            self.inner.next_message().await
        }
    }

    #[tokio::test]
    async fn test_failed_acquire_rolls_back() {
        let pubsub = Refusing {
            inner: MemoryStore::new(),
            refuse: "battery:3:data",
        };
        let mut registry = SubscriptionRegistry::new();

        assert!(registry.acquire(&pubsub, &channels(&[1, 2, 3])).await.is_err());

        assert!(registry.is_empty());
        assert!(!pubsub.inner.is_subscribed("battery:1:data"));
        assert!(!pubsub.inner.is_subscribed("battery:2:data"));
    }
}
