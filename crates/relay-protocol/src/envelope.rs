//! Envelope types for the Relay protocol.
//!
//! Every message on the wire is a single JSON object. Clients send a
//! [`ClientFrame`]; the server stamps it with the authenticated sender and
//! fans out the resulting [`Envelope`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Who an envelope is addressed to.
///
/// Any other value fails to decode, so a frame with an unknown kind is malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverKind {
    /// Every live connection of a single user.
    User,
    /// Every live connection of every member of a room.
    Group,
}

impl ReceiverKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiverKind::User => "user",
            ReceiverKind::Group => "group",
        }
    }
}

impl fmt::Display for ReceiverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame as received from a client.
///
/// `sender_id` is accepted so that clients echoing envelopes back do not
/// fail to decode, but it is never trusted: [`ClientFrame::stamp`] replaces it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientFrame {
    /// Event label.
    pub event: String,
    /// Sender claimed by the client. Discarded.
    #[serde(default)]
    pub sender_id: Option<String>,
    /// Target user id or room id.
    pub receiver_id: String,
    /// How `receiver_id` is interpreted.
    pub receiver_type: ReceiverKind,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    /// Create a frame addressed to a user.
    #[must_use]
    pub fn to_user(event: impl Into<String>, receiver: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            sender_id: None,
            receiver_id: receiver.into(),
            receiver_type: ReceiverKind::User,
            data,
        }
    }

    /// Create a frame addressed to a room.
    #[must_use]
    pub fn to_group(event: impl Into<String>, room: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            sender_id: None,
            receiver_id: room.into(),
            receiver_type: ReceiverKind::Group,
            data,
        }
    }

    /// Turn the frame into a routable envelope owned by `sender`.
    ///
    /// Whatever sender the client claimed is overwritten.
    #[must_use]
    pub fn stamp(self, sender: impl Into<String>) -> Envelope {
        Envelope {
            event: self.event,
            sender_id: sender.into(),
            receiver_id: self.receiver_id,
            receiver_type: self.receiver_type,
            data: self.data,
        }
    }
}

/// A routable envelope with a server-assigned sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event label.
    pub event: String,
    /// Authenticated sender.
    pub sender_id: String,
    /// Target user id or room id.
    pub receiver_id: String,
    /// How `receiver_id` is interpreted.
    pub receiver_type: ReceiverKind,
    /// Opaque payload.
    pub data: Value,
}

impl Envelope {
    /// Size of the payload once serialized, used for metrics.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_receiver_kind_wire_names() {
        assert_eq!(serde_json::to_string(&ReceiverKind::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&ReceiverKind::Group).unwrap(), "\"group\"");
        assert_eq!(ReceiverKind::Group.to_string(), "group");
    }

    #[test]
    fn test_stamp_overwrites_claimed_sender() {
        let mut frame = ClientFrame::to_user("msg", "u1", json!("hi"));
        frame.sender_id = Some("mallory".to_string());

        let envelope = frame.stamp("u2");
        assert_eq!(envelope.sender_id, "u2");
        assert_eq!(envelope.receiver_id, "u1");
        assert_eq!(envelope.receiver_type, ReceiverKind::User);
        assert_eq!(envelope.data, json!("hi"));
    }

    #[test]
    fn test_group_frame() {
        let envelope = ClientFrame::to_group("typing", "room-1", Value::Null).stamp("u1");
        assert_eq!(envelope.receiver_type, ReceiverKind::Group);
        assert_eq!(envelope.payload_len(), 4);
    }

    #[test]
    fn test_unknown_kind_and_missing_event_rejected() {
        assert!(serde_json::from_value::<ReceiverKind>(json!("channel")).is_err());
        assert!(serde_json::from_value::<ReceiverKind>(json!("User")).is_err());

        let missing_event = json!({"receiver_id": "u1", "receiver_type": "user"});
        assert!(serde_json::from_value::<ClientFrame>(missing_event).is_err());
    }
}
