//! Transport abstraction traits for Relay.
//!
//! A connection is split into an inbound [`FrameSource`] driven by the read
//! pump and an outbound [`FrameSink`] owned by the write pump, so the two
//! directions never contend for the socket.

use async_trait::async_trait;
use relay_protocol::{ClientFrame, Envelope, ProtocolError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A write did not complete in time.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer sent something that is not a valid frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next decoded frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError>;

    /// Remote address of the peer, if known.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// Outbound half of a connection. Only the write pump holds one.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one envelope.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Close the transport. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}
