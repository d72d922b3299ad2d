use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::serde_helpers::StringFromAny;
use crate::types::{DateTime, Decimal, Utc};

/// Expense lifecycle events pushed on the expenses channel.
#[non_exhaustive]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::AsRefStr,
)]
pub enum EventKind {
    #[serde(rename = "expense-created")]
    #[strum(serialize = "expense-created")]
    Created,
    #[serde(rename = "expense-processed")]
    #[strum(serialize = "expense-processed")]
    Processed,
    #[serde(rename = "expense-updated")]
    #[strum(serialize = "expense-updated")]
    Updated,
    #[serde(rename = "expense-deleted")]
    #[strum(serialize = "expense-deleted")]
    Deleted,
    #[serde(rename = "expense-verified")]
    #[strum(serialize = "expense-verified")]
    Verified,
    #[serde(rename = "expense-rejected")]
    #[strum(serialize = "expense-rejected")]
    Rejected,
}

impl EventKind {
    /// Every kind, in wire-protocol order.
    pub const ALL: [EventKind; 6] = [
        Self::Created,
        Self::Processed,
        Self::Updated,
        Self::Deleted,
        Self::Verified,
        Self::Rejected,
    ];

    /// Look up a kind by its wire event name, e.g. `expense-created`.
    #[must_use]
    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.event_name() == name)
    }

    /// The wire event name.
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Created => "expense-created",
            Self::Processed => "expense-processed",
            Self::Updated => "expense-updated",
            Self::Deleted => "expense-deleted",
            Self::Verified => "expense-verified",
            Self::Rejected => "expense-rejected",
        }
    }
}

/// Review status carried by an expense snapshot.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpenseStatus {
    Pending,
    Processing,
    Processed,
    Verified,
    Rejected,
    /// A status this client does not know about yet
    #[serde(other)]
    Unknown,
}

/// Snapshot of one expense resource as carried by an event.
///
/// Only `id` is guaranteed; everything else depends on the producing endpoint.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    /// Expense identifier, integers on the wire are normalized to strings
    #[serde(with = "serde_with::As::<StringFromAny>")]
    #[builder(into)]
    pub id: String,
    /// Owning organization
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_with::As::<Option<StringFromAny>>"
    )]
    #[builder(into)]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// ISO 4217 currency code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExpenseStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_with::As::<Option<StringFromAny>>"
    )]
    #[builder(into)]
    pub category_id: Option<String>,
    /// Location of the uploaded receipt, once processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub receipt_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A decoded lifecycle event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseEvent {
    pub kind: EventKind,
    pub expense: Expense,
}

impl ExpenseEvent {
    #[must_use]
    pub fn new(kind: EventKind, expense: Expense) -> Self {
        Self { kind, expense }
    }
}

/// What a subscriber callback receives.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelUpdate {
    /// An event of the subscribed kind
    Event(ExpenseEvent),
    /// The channel's connection could not be established; the subscription stays registered
    ConnectionError {
        /// Human-readable cause
        reason: String,
    },
    /// Reconnection gave up; nothing arrives until the channel is acquired again
    ConnectionLost {
        /// Number of reconnection attempts that were made
        attempts: u32,
    },
}

impl ChannelUpdate {
    /// The event, if this update carries one.
    #[must_use]
    pub fn as_event(&self) -> Option<&ExpenseEvent> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

/// Wire envelope: `{"event": "expense-created", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) event: String,
    #[serde(default)]
    pub(crate) data: Value,
}
