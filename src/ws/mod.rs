//! Core WebSocket infrastructure.
//!
//! This module owns the transport side of the feed: one authenticated socket per
//! [`Channel`], its lifecycle, heartbeat and reconnection. What a connection does
//! with inbound frames is delegated to an [`EventSink`].
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: at most one live [`Connection`] per channel, lazily created,
//!   replaced when the session credential changes
//! - [`Connection`]: transport task with heartbeat and reconnection
//! - [`ReconnectPolicy`]: bounded exponential backoff after a dropped connection
//! - [`EventSink`] / [`MessageParser`]: seams towards event decoding and routing
//!
//! # Example
//!
//! ```ignore
//! let manager = ConnectionManager::new(endpoint, config, tokens, dispatcher)?;
//! let connection = manager.acquire(&Channel::EXPENSES)?;
//! connection.wait_connected().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod reconnect;
pub mod traits;

pub use connection::{Connection, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use manager::{Channel, ConnectionManager};
pub use reconnect::ReconnectPolicy;
pub use traits::*;
