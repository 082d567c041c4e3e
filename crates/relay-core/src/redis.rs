//! Redis implementation of the store contract.
//!
//! Reads go through a multiplexed connection. Pub/sub uses a dedicated
//! connection split into a command sink (subscribe/unsubscribe, serialized
//! behind a mutex) and a message stream owned by whoever is listening.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::store::{Notification, PubSub, Store, StoreError};

/// Connection settings for the Redis backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database index.
    pub db: i64,
    /// Optional password.
    pub password: Option<String>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisSettings {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal() {
            StoreError::ConnectionLost(e.to_string())
        } else if e.kind() == redis::ErrorKind::TypeError {
            StoreError::Malformed(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Redis-backed [`Store`] and [`PubSub`].
pub struct RedisStore {
    conn: MultiplexedConnection,
    sink: Mutex<PubSubSink>,
    stream: Mutex<PubSubStream>,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or rejects the
    /// credentials.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.connection_info())?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "Redis ping");

        let (sink, stream) = client.get_async_pubsub().await?.split();

        info!(
            host = %settings.host,
            port = settings.port,
            db = settings.db,
            "Connected to Redis"
        );

        Ok(Self {
            conn,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: usize = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.publish(channel, payload).await?)
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.sink.lock().await.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.sink.lock().await.unsubscribe(channel).await?;
        Ok(())
    }

    async fn next_message(&self) -> Result<Notification, StoreError> {
        let mut stream = self.stream.lock().await;
        match stream.next().await {
            Some(msg) => Ok(Notification::new(
                msg.get_channel_name(),
                msg.get_payload_bytes(),
            )),
            None => Err(StoreError::ConnectionLost(
                "Redis pub/sub stream ended".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info() {
        let settings = RedisSettings {
            host: "redis.internal".into(),
            port: 6380,
            db: 2,
            password: Some("secret".into()),
        };
        let info = settings.connection_info();

        assert_eq!(info.addr, ConnectionAddr::Tcp("redis.internal".into(), 6380));
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_empty_password_is_none() {
        let settings = RedisSettings {
            password: Some(String::new()),
            ..Default::default()
        };
        assert!(settings.connection_info().redis.password.is_none());
    }

    #[test]
    fn test_error_classification() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(StoreError::from(io).is_fatal());

        let wrong_type = RedisError::from((redis::ErrorKind::TypeError, "not a hash"));
        assert!(matches!(StoreError::from(wrong_type), StoreError::Malformed(_)));
    }
}
