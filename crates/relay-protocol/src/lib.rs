//! # relay-protocol
//!
//! Wire format for the Relay fan-out router.
//!
//! Clients and the server exchange JSON objects of the shape
//!
//! ```text
//! { "event": "...", "sender_id": "...", "receiver_id": "...",
//!   "receiver_type": "user" | "group", "data": <any JSON> }
//! ```
//!
//! The sender is always assigned by the server.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ReceiverKind};
//!
//! let raw = br#"{"event":"msg","receiver_id":"u1","receiver_type":"user","data":"hi"}"#;
//! let envelope = codec::decode(raw).unwrap().stamp("u2");
//!
//! assert_eq!(envelope.sender_id, "u2");
//! assert_eq!(envelope.receiver_type, ReceiverKind::User);
//! let text = codec::encode(&envelope).unwrap();
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{ClientFrame, Envelope, ReceiverKind};
