//! Rooms: named sets of user ids addressed by group envelopes.
//!
//! Rooms are never created implicitly. Creating a room that already exists
//! replaces its membership wholesale.

use crate::connection::UserId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Maximum room id length in bytes.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the id is empty, too long, or contains
/// anything other than printable ASCII.
pub fn validate_room_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// A named group of users.
#[derive(Debug, Clone)]
pub struct Room {
    id: RoomId,
    members: HashSet<UserId>,
}

impl Room {
    /// Create a room with the given members.
    #[must_use]
    pub fn new<I, S>(id: impl Into<RoomId>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        Self {
            id: id.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Room id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Iterate over member ids.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    /// Number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Whether `user_id` is a member.
    #[must_use]
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    /// Add a member. Returns `false` if already present.
    pub fn add_member(&mut self, user_id: impl Into<UserId>) -> bool {
        self.members.insert(user_id.into())
    }

    /// Remove a member. Returns `false` if not present.
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        self.members.remove(user_id)
    }

    /// Whether the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// All rooms, keyed by id. Mutated only by the hub task.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, Room>,
}

impl RoomDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room or replace an existing room's membership entirely.
    ///
    /// Returns `true` if a room was replaced.
    pub fn create_or_replace<I, S>(&mut self, id: impl Into<RoomId>, members: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        let room = Room::new(id, members);
        debug!(room = %room.id(), members = room.member_count(), "Room set");
        self.rooms.insert(room.id.clone(), room).is_some()
    }

    /// Add a member to an existing room. Unknown rooms are left alone.
    pub fn add_member(&mut self, id: &str, user_id: impl Into<UserId>) -> bool {
        self.rooms
            .get_mut(id)
            .is_some_and(|room| room.add_member(user_id))
    }

    /// Remove a member from a room. The room stays even when emptied.
    pub fn remove_member(&mut self, id: &str, user_id: &str) -> bool {
        self.rooms
            .get_mut(id)
            .is_some_and(|room| room.remove_member(user_id))
    }

    /// Delete a room.
    pub fn remove(&mut self, id: &str) -> Option<Room> {
        self.rooms.remove(id)
    }

    /// Look up a room.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Room> {
        self.rooms.get(id)
    }

    /// Whether a room exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.rooms.contains_key(id)
    }

    /// Number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether there are no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Delete every room.
    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}
