//! In-process store for single-node runs and tests.
//!
//! Mirrors the Redis semantics the relay depends on: publishes reach only
//! currently subscribed channels, and missing keys read as empty. It can
//! also inject read failures, slow reads down and sever its "connection".

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::store::{Notification, PubSub, Store, StoreError};

/// A subscribe or unsubscribe issued against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubCall {
    /// `subscribe(channel)`
    Subscribe(String),
    /// `unsubscribe(channel)`
    Unsubscribe(String),
}

/// In-memory implementation of [`Store`] and [`PubSub`].
#[derive(Debug)]
pub struct MemoryStore {
    sets: DashMap<String, BTreeSet<String>>,
    hashes: DashMap<String, HashMap<String, String>>,
    subscribed: DashSet<String>,
    calls: std::sync::Mutex<Vec<PubSubCall>>,
    failing_reads: AtomicUsize,
    read_delay_ms: AtomicU64,
    reads_started: AtomicUsize,
    severed: AtomicBool,
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Notification>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sets: DashMap::new(),
            hashes: DashMap::new(),
            subscribed: DashSet::new(),
            calls: std::sync::Mutex::new(Vec::new()),
            failing_reads: AtomicUsize::new(0),
            read_delay_ms: AtomicU64::new(0),
            reads_started: AtomicUsize::new(0),
            severed: AtomicBool::new(false),
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    /// Make the next `count` hash reads fail with a command error.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Hold every later hash read for `delay` before answering.
    pub fn delay_reads(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of hash reads issued so far, finished or not.
    #[must_use]
    pub fn reads_started(&self) -> usize {
        self.reads_started.load(Ordering::SeqCst)
    }

    /// Drop the connection: every later call fails and the message stream
    /// ends once drained.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
        lock(&self.tx).take();
        debug!("Memory store severed");
    }

    /// Check if a channel is currently subscribed.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed.contains(channel)
    }

    /// Every subscribe/unsubscribe issued so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<PubSubCall> {
        lock(&self.calls).clone()
    }

    /// Number of unsubscribe calls issued for `channel`.
    #[must_use]
    pub fn unsubscribe_calls(&self, channel: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| matches!(call, PubSubCall::Unsubscribe(c) if c == channel))
            .count()
    }

    fn check_connected(&self) -> Result<(), StoreError> {
        if self.severed.load(Ordering::SeqCst) {
            Err(StoreError::ConnectionLost("memory store severed".into()))
        } else {
            Ok(())
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record(&self, call: PubSubCall) {
        lock(&self.calls).push(call);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_connected()?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_connected()?;
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_connected()?;
        self.reads_started.fetch_add(1, Ordering::SeqCst);

        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.take_injected_failure() {
            return Err(StoreError::Command(format!("injected read failure on {key}")));
        }
        Ok(self.hashes.get(key).map(|h| h.value().clone()).unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.check_connected()?;
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError> {
        self.check_connected()?;
        if !self.subscribed.contains(channel) {
            return Ok(0);
        }
        match lock(&self.tx).as_ref() {
            Some(tx) if tx.send(Notification::new(channel, payload)).is_ok() => Ok(1),
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.check_connected()?;
        self.subscribed.insert(channel.to_string());
        self.record(PubSubCall::Subscribe(channel.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.check_connected()?;
        self.subscribed.remove(channel);
        self.record(PubSubCall::Unsubscribe(channel.to_string()));
        Ok(())
    }

    async fn next_message(&self) -> Result<Notification, StoreError> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| StoreError::ConnectionLost("memory store severed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribed_channels_only() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("battery:1:data", b"x").await.unwrap(), 0);

        store.subscribe("battery:1:data").await.unwrap();
        assert_eq!(store.publish("battery:1:data", b"x").await.unwrap(), 1);

        let msg = store.next_message().await.unwrap();
        assert_eq!(msg.channel, "battery:1:data");
        assert_eq!(msg.payload, b"x");
    }

    #[tokio::test]
    async fn test_missing_keys_read_empty() {
        let store = MemoryStore::new();
        assert!(store.set_members("info:batteries:ids").await.unwrap().is_empty());
        assert!(store.hash_get_all("battery:1:data").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_reads(1);
        assert!(matches!(
            store.hash_get_all("k").await,
            Err(StoreError::Command(_))
        ));
        assert!(store.hash_get_all("k").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_reads_are_counted() {
        let store = MemoryStore::new();
        store.delay_reads(Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        store.hash_get_all("k").await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(store.reads_started(), 1);
    }

    #[tokio::test]
    async fn test_sever_ends_stream() {
        let store = MemoryStore::new();
        store.sever();
        let err = store.next_message().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(store.subscribe("c").await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_calls_are_logged() {
        let store = MemoryStore::new();
        store.subscribe("a").await.unwrap();
        store.unsubscribe("a").await.unwrap();
        assert_eq!(
            store.calls(),
            vec![
                PubSubCall::Subscribe("a".into()),
                PubSubCall::Unsubscribe("a".into())
            ]
        );
        assert_eq!(store.unsubscribe_calls("a"), 1);
        assert!(!store.is_subscribed("a"));
    }
}
