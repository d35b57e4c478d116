//! Shared fixtures for the Relay benchmarks.

use relay_core::{Connection, Hub, OutboundQueue};
use relay_protocol::{ClientFrame, Envelope};
use serde_json::json;

/// A hub with `users` users holding `per_user` connections each, named
/// `user-0`, `user-1`, ... Returns the queues so callers can drain them.
#[must_use]
pub fn populated_hub(users: usize, per_user: usize, capacity: usize) -> (Hub, Vec<OutboundQueue>) {
    let mut hub = Hub::new();
    let mut queues = Vec::with_capacity(users * per_user);
    for user in 0..users {
        for _ in 0..per_user {
            let (connection, queue) = Connection::open(format!("user-{}", user), capacity);
            hub.register(connection);
            queues.push(queue);
        }
    }
    (hub, queues)
}

/// A direct message of roughly `len` payload bytes.
#[must_use]
pub fn direct_message(to: &str, len: usize) -> Envelope {
    ClientFrame::to_user("msg", to, json!({ "text": "x".repeat(len) })).stamp("sender")
}

/// A group message of roughly `len` payload bytes.
#[must_use]
pub fn group_message(room: &str, len: usize) -> Envelope {
    ClientFrame::to_group("msg", room, json!({ "text": "x".repeat(len) })).stamp("sender")
}

/// Empty every queue without blocking. Returns how many envelopes were taken.
pub fn drain(queues: &mut [OutboundQueue]) -> usize {
    let mut taken = 0;
    for queue in queues {
        while queue.try_recv().is_some() {
            taken += 1;
        }
    }
    taken
}
