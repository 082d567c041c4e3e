//! # relay-protocol
//!
//! Frames pushed from the telemetry relay to connected clients.
//!
//! The relay only ever talks in one direction: the server sends JSON text
//! frames, and anything the client sends back is ignored apart from close
//! and ping handling in the transport.
//!
//! ## Frame Types
//!
//! - `Snapshot` - sent once to a new client, every tracked entity keyed by
//!   its channel name (`null` when the store has no record)
//! - `Update` - one entity's fresh state, stamped with `ws_timestamp` and
//!   `latency_ms`, broadcast to every client
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Frame, Record};
//!
//! let mut record = Record::new();
//! record.insert("voltage".into(), 42.into());
//!
//! let frame = Frame::update("battery:7:data", record);
//! let text = codec::encode(&frame).unwrap();
//! let entries = codec::decode(&text).unwrap();
//! assert!(entries.contains_key("battery:7:data"));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Entries, Frame, Record, LATENCY_FIELD, RECEIPT_FIELD};
