//! JSON codec for Relay frames.
//!
//! Inbound frames are size-checked before parsing; outbound envelopes are
//! serialized to a single JSON text message.

use thiserror::Error;

use crate::envelope::{ClientFrame, Envelope};

/// Hard upper bound on a single frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the allowed size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Limit that was exceeded.
        max: usize,
    },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a client frame, rejecting anything above [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a valid frame.
pub fn decode(data: &[u8]) -> Result<ClientFrame, ProtocolError> {
    decode_limited(data, MAX_FRAME_SIZE)
}

/// Decode a client frame with a caller-supplied size limit.
///
/// The limit is clamped to [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a valid frame.
pub fn decode_limited(data: &[u8], max: usize) -> Result<ClientFrame, ProtocolError> {
    let max = max.min(MAX_FRAME_SIZE);
    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }

    Ok(serde_json::from_slice(data)?)
}
