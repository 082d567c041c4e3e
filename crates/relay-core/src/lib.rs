//! # relay-core
//!
//! Session lifecycle and broadcast machinery for the telemetry relay.
//!
//! Producers write each entity's state to a hash and publish on its channel.
//! The relay keeps the store subscribed to exactly the channels its
//! sessions need, re-reads an entity whenever its channel fires, and fans
//! the stamped record out to every session.
//!
//! - **Registry** - Reference-counted channel subscriptions
//! - **Snapshot** - Reading entity state from the store
//! - **Listener** - Background task turning notifications into updates
//! - **Manager** - Connect/disconnect, owning all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ connect/disconnect ┌─────────────┐     ┌─────────────┐
//! │   Session   │───────────────────▶│    Relay    │────▶│  Registry   │
//! └─────────────┘                    └─────────────┘     └─────────────┘
//!        ▲                                  │ start/stop        │ (un)subscribe
//!        │ frames                           ▼                   ▼
//! ┌─────────────┐     broadcast      ┌─────────────┐     ┌─────────────┐
//! │ SessionSet  │◀───────────────────│  Listener   │◀────│   Store     │
//! └─────────────┘                    └─────────────┘     └─────────────┘
//! ```

pub mod keys;
pub mod listener;
pub mod manager;
pub mod memory;
pub mod metrics;
#[cfg(feature = "redis")]
pub mod redis;
pub mod registry;
pub mod sessions;
pub mod snapshot;
pub mod store;

pub use keys::{ChannelName, EntityId, KeySpace};
pub use listener::{ListenerError, ListenerState};
pub use manager::{Relay, RelayConfig, RelayError};
pub use memory::MemoryStore;
pub use registry::SubscriptionRegistry;
pub use sessions::SessionSet;
pub use snapshot::{EntitySnapshot, SnapshotReader};
pub use store::{Notification, PubSub, Store, StoreError};

#[cfg(feature = "redis")]
pub use crate::redis::{RedisSettings, RedisStore};
