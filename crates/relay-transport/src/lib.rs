//! # relay-transport
//!
//! Transport seam for the Relay fan-out router.
//!
//! - **WebSocket** - axum upgraded sockets
//! - **Memory** - in-process peer for tests and benchmarks
//!
//! Every transport splits into a [`FrameSource`] and a [`FrameSink`]; the
//! [`pump`] module drives them against the hub.
//!
//! ```rust,ignore
//! use relay_transport::{pump, websocket};
//!
//! let (sink, source) = websocket::split(socket, max_message_size, None);
//! pump::serve_connection(hub, user_id, source, sink, pump::DEFAULT_WRITE_TIMEOUT).await?;
//! ```

pub mod memory;
pub mod pump;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use pump::{
    read_pump, serve_connection, write_pump, ConnectionSummary, ReadEnd, WriteEnd,
    DEFAULT_WRITE_TIMEOUT,
};
pub use traits::{FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketSink, WebSocketSource};
