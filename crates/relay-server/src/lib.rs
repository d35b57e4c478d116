//! # relay-server
//!
//! HTTP host around the Relay hub: token verification, rate limiting, room
//! management routes, the WebSocket endpoint, metrics and configuration.
//!
//! ```rust,ignore
//! let config = relay_server::config::Config::load()?;
//! relay_server::handlers::run_server(config).await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod store;

pub use auth::{AuthError, AuthUser, Claims, JwtVerifier};
pub use config::Config;
pub use error::ApiError;
pub use handlers::{router, run_server, AppState};
pub use store::RedisWindowStore;
