//! # relay-core
//!
//! Routing core of the Relay fan-out router.
//!
//! - **Hub** - single task owning all routing state, reached by message passing
//! - **Registry** - user id to live connections
//! - **Room** - named member sets for group delivery
//! - **Connection** - hub-side handle and bounded outbound queue
//! - **Rate limit** - sliding-window admission gate
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  Route / Register   ┌─────────┐  try_enqueue  ┌────────────┐
//! │ read pumps │────────────────────▶│   Hub   │──────────────▶│ write pump │
//! └────────────┘   (mpsc ingress)    └─────────┘  (per conn)   └────────────┘
//!                                     │       │
//!                               Registry     Rooms
//! ```

pub mod connection;
pub mod hub;
pub mod ratelimit;
pub mod registry;
pub mod room;

pub use connection::{Connection, ConnectionId, ConnectionKey, EnqueueError, OutboundQueue, UserId};
pub use hub::{Hub, HubCommand, HubConfig, HubError, HubHandle, HubStats};
pub use ratelimit::{
    Decision, MemoryWindowStore, RateLimitConfig, RateLimiter, StoreError, WindowStore,
};
pub use registry::{Delivery, SessionRegistry};
pub use room::{validate_room_id, Room, RoomDirectory, RoomId};
