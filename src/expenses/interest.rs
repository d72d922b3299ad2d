use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use super::types::EventKind;

bitflags! {
    /// Set of event kinds that currently have at least one subscriber.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventInterest: u8 {
        /// No interest in any event.
        const NONE = 0;

        const CREATED = 1;
        const PROCESSED = 1 << 1;
        const UPDATED = 1 << 2;
        const DELETED = 1 << 3;
        const VERIFIED = 1 << 4;
        const REJECTED = 1 << 5;

        /// Interest in every expense event.
        const ALL = Self::CREATED.bits()
            | Self::PROCESSED.bits()
            | Self::UPDATED.bits()
            | Self::DELETED.bits()
            | Self::VERIFIED.bits()
            | Self::REJECTED.bits();
    }
}

impl EventInterest {
    /// Get the interest flag for a wire event name, [`EventInterest::NONE`] when unknown.
    #[must_use]
    pub fn from_event_name(name: &str) -> Self {
        EventKind::from_event_name(name).map_or(Self::NONE, Self::from)
    }

    #[must_use]
    pub fn is_interested_in_event(&self, name: &str) -> bool {
        let interest = EventInterest::from_event_name(name);
        !interest.is_empty() && self.contains(interest)
    }
}

impl From<EventKind> for EventInterest {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Created => Self::CREATED,
            EventKind::Processed => Self::PROCESSED,
            EventKind::Updated => Self::UPDATED,
            EventKind::Deleted => Self::DELETED,
            EventKind::Verified => Self::VERIFIED,
            EventKind::Rejected => Self::REJECTED,
        }
    }
}

impl Default for EventInterest {
    fn default() -> Self {
        Self::NONE
    }
}

/// Interest set shared between the registry (writer) and frame parsing (reader).
#[derive(Debug, Default)]
pub(crate) struct InterestTracker {
    interest: AtomicU8,
}

impl InterestTracker {
    /// Replace the current interest set.
    pub(crate) fn set(&self, interest: EventInterest) {
        self.interest.store(interest.bits(), Ordering::Release);
    }

    #[must_use]
    pub(crate) fn get(&self) -> EventInterest {
        EventInterest::from_bits(self.interest.load(Ordering::Acquire))
            .unwrap_or(EventInterest::NONE)
    }
}
