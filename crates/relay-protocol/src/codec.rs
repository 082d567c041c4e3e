//! Codec for encoding and decoding relay frames.
//!
//! Frames travel as WebSocket text messages holding a single JSON object.

use thiserror::Error;

use crate::frames::{Entries, Frame};

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a frame to JSON text.
///
/// # Errors
///
/// Returns an error if encoding fails or the result is too large.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(ProtocolError::Encode)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode frame text into its entries.
///
/// Snapshot and update frames share one wire shape, so the result is the
/// channel-keyed map either of them carries.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a JSON object of
/// objects (or nulls).
pub fn decode(text: &str) -> Result<Entries, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    serde_json::from_str(text).map_err(ProtocolError::Decode)
}
