//! Connection handles.
//!
//! A [`Connection`] is the hub's side of one live socket: it owns the only
//! sender of the connection's bounded outbound queue. The write pump owns the
//! matching [`OutboundQueue`]. Dropping the `Connection` closes the queue,
//! which is the only signal the write pump needs to finish.

use relay_protocol::Envelope;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// A user identifier as resolved by authentication.
pub type UserId = String;

/// Process-wide counter backing [`ConnectionId::next`].
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque connection identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Everything needed to find a connection in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Owning user.
    pub user_id: UserId,
    /// Connection identifier.
    pub id: ConnectionId,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.id)
    }
}

/// Why an envelope could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue is at capacity.
    #[error("outbound queue full")]
    Full,

    /// The write pump has gone away.
    #[error("outbound queue closed")]
    Closed,
}

/// The hub's handle to a live connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::Sender<Arc<Envelope>>,
}

impl Connection {
    /// Open a connection for `user_id` with an outbound queue of `capacity`
    /// envelopes (at least one).
    #[must_use]
    pub fn open(user_id: impl Into<UserId>, capacity: usize) -> (Self, OutboundQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: ConnectionId::next(),
            user_id: user_id.into(),
            sender,
        };
        (connection, OutboundQueue { receiver })
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Registry key for this connection.
    #[must_use]
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            user_id: self.user_id.clone(),
            id: self.id,
        }
    }

    /// Whether the write pump is still consuming.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Number of envelopes waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Queue an envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] if the queue is at capacity and
    /// [`EnqueueError::Closed`] if the write pump is gone.
    pub fn try_enqueue(&self, envelope: Arc<Envelope>) -> Result<(), EnqueueError> {
        self.sender.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Consumer side of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    receiver: mpsc::Receiver<Arc<Envelope>>,
}

impl OutboundQueue {
    /// Wait for the next envelope.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.recv().await
    }

    /// Take the next envelope if one is ready.
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.try_recv().ok()
    }

    /// Whether the hub has closed the queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Number of envelopes waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no envelopes are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
