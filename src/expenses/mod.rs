//! Expense lifecycle events over the authenticated expenses channel.
//!
//! - [`EventRegistry`]: event kind → callbacks, copy-on-dispatch
//! - [`EventDispatcher`]: decodes inbound frames and routes them to callbacks
//! - [`Client`]: subscribe/unsubscribe facade that keeps the channel connected

pub mod client;
pub mod dispatcher;
pub mod interest;
pub mod registry;
pub mod types;

pub use client::Client;
pub use dispatcher::{DispatchReport, EventDispatcher, ExpenseParser, SubscriberError, parse_frame};
pub use interest::EventInterest;
pub use registry::{BoxError, Callback, EventRegistry, SubscriptionHandle, SubscriptionInfo};
pub use types::{ChannelUpdate, EventKind, Expense, ExpenseEvent, ExpenseStatus};

pub use crate::ws::WsError;
