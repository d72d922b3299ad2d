//! Re-exported types from external crates for convenience.
//!
//! These types are used by the expense payloads and are re-exported here
//! so users don't need to add these dependencies to their `Cargo.toml`.

/// Date and time types for expense timestamps.
pub use chrono::{DateTime, Utc};
/// Arbitrary precision decimal type for expense amounts.
pub use rust_decimal::Decimal;
/// Identifier type for connections.
pub use uuid::Uuid;
