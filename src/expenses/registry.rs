#![expect(
    clippy::module_name_repetitions,
    reason = "EventRegistry names its role next to the event types it stores"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use dashmap::DashMap;

use super::interest::{EventInterest, InterestTracker};
use super::types::{ChannelUpdate, EventKind};

/// Error type a subscriber callback may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Subscriber callback.
///
/// Invoked from the connection task, one update at a time, so it should return quickly.
pub type Callback = Arc<dyn Fn(&ChannelUpdate) -> Result<(), BoxError> + Send + Sync>;

/// Identifies one subscription. Returned by [`EventRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Information about an active subscription.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionInfo {
    pub handle: SubscriptionHandle,
    /// When the subscription was created.
    pub created_at: Instant,
}

#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) callback: Callback,
    created_at: Instant,
}

/// Event-kind → callbacks table.
///
/// Each kind's callbacks live in an `Arc<Vec<_>>`. Dispatch works on a cloned
/// `Arc`, and mutations go through [`Arc::make_mut`], so a subscribe or
/// unsubscribe issued while a dispatch is running only affects later dispatches.
/// Registrations are independent of any connection and survive reconnects.
pub struct EventRegistry {
    subscriptions: DashMap<EventKind, Arc<Vec<Registration>>>,
    next_id: AtomicU64,
    interest: Arc<InterestTracker>,
    /// Serializes mutations so the published interest set never lags behind the table
    write_lock: Mutex<()>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            interest: Arc::new(InterestTracker::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register `callback` for `kind`. Callbacks of one kind run in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChannelUpdate) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        let registration = Registration {
            handle,
            callback: Arc::new(callback),
            created_at: Instant::now(),
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entry = self.subscriptions.entry(kind).or_default();
        Arc::make_mut(entry.value_mut()).push(registration);
        drop(entry);
        self.publish_interest();

        #[cfg(feature = "tracing")]
        tracing::debug!(subscription = %handle, "Subscribed");

        handle
    }

    /// Remove one subscription. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let removed = match self.subscriptions.get_mut(&handle.kind) {
            Some(mut entry) => {
                let registrations = Arc::make_mut(entry.value_mut());
                let before = registrations.len();
                registrations.retain(|registration| registration.handle != handle);
                before != registrations.len()
            }
            None => false,
        };

        if removed {
            self.subscriptions
                .remove_if(&handle.kind, |_, registrations| registrations.is_empty());
            self.publish_interest();

            #[cfg(feature = "tracing")]
            tracing::debug!(subscription = %handle, "Unsubscribed");
        }

        removed
    }

    /// Remove every subscription of `kind`, returning how many were removed.
    pub fn unsubscribe_all(&self, kind: EventKind) -> usize {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let removed = self
            .subscriptions
            .remove(&kind)
            .map_or(0, |(_, registrations)| registrations.len());
        self.publish_interest();

        #[cfg(feature = "tracing")]
        tracing::debug!(%kind, removed, "Unsubscribed all");

        removed
    }

    /// Total number of subscriptions across all kinds.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    #[must_use]
    pub fn subscriber_count_for(&self, kind: EventKind) -> usize {
        self.subscriptions
            .get(&kind)
            .map_or(0, |entry| entry.value().len())
    }

    /// Kinds that currently have at least one subscriber.
    #[must_use]
    pub fn interest(&self) -> EventInterest {
        self.interest.get()
    }

    /// All active subscriptions, oldest first.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registrations()
            .into_iter()
            .map(|registration| SubscriptionInfo {
                handle: registration.handle,
                created_at: registration.created_at,
            })
            .collect()
    }

    /// Immutable snapshot of the callbacks for `kind`.
    pub(crate) fn snapshot(&self, kind: EventKind) -> Option<Arc<Vec<Registration>>> {
        self.subscriptions
            .get(&kind)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Every registration across kinds, in registration order.
    pub(crate) fn registrations(&self) -> Vec<Registration> {
        let mut all: Vec<Registration> = self
            .subscriptions
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|registration| registration.handle.id);
        all
    }

    pub(crate) fn interest_tracker(&self) -> Arc<InterestTracker> {
        Arc::clone(&self.interest)
    }

    fn publish_interest(&self) {
        let interest = self
            .subscriptions
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .fold(EventInterest::NONE, |acc, entry| {
                acc | EventInterest::from(*entry.key())
            });
        self.interest.set(interest);
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("subscriptions", &self.subscriber_count())
            .field("interest", &self.interest())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &ChannelUpdate) -> Result<(), BoxError> {
        Ok(())
    }

    #[test]
    fn subscribe_tracks_counts_and_interest() {
        let registry = EventRegistry::new();

        registry.subscribe(EventKind::Created, noop);
        registry.subscribe(EventKind::Created, noop);
        registry.subscribe(EventKind::Verified, noop);

        assert_eq!(registry.subscriber_count(), 3);
        assert_eq!(registry.subscriber_count_for(EventKind::Created), 2);
        assert_eq!(registry.subscriber_count_for(EventKind::Deleted), 0);
        assert_eq!(
            registry.interest(),
            EventInterest::CREATED | EventInterest::VERIFIED
        );
    }

    #[test]
    fn unsubscribe_twice_is_a_no_op() {
        let registry = EventRegistry::new();
        let handle = registry.subscribe(EventKind::Updated, noop);

        assert!(registry.unsubscribe(handle));
        assert!(!registry.unsubscribe(handle));
        assert_eq!(registry.subscriber_count(), 0);
        assert!(registry.interest().is_empty());
    }

    #[test]
    fn unsubscribe_keeps_other_subscribers_of_kind() {
        let registry = EventRegistry::new();
        let first = registry.subscribe(EventKind::Rejected, noop);
        let second = registry.subscribe(EventKind::Rejected, noop);

        registry.unsubscribe(first);

        let remaining: Vec<_> = registry
            .active_subscriptions()
            .into_iter()
            .map(|info| info.handle)
            .collect();
        assert_eq!(remaining, vec![second]);
        assert!(registry.interest().contains(EventInterest::REJECTED));
    }

    #[test]
    fn unsubscribe_all_only_touches_one_kind() {
        let registry = EventRegistry::new();
        registry.subscribe(EventKind::Created, noop);
        registry.subscribe(EventKind::Created, noop);
        registry.subscribe(EventKind::Deleted, noop);

        assert_eq!(registry.unsubscribe_all(EventKind::Created), 2);
        assert_eq!(registry.unsubscribe_all(EventKind::Created), 0);
        assert_eq!(registry.subscriber_count(), 1);
        assert_eq!(registry.interest(), EventInterest::DELETED);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_mutation() {
        let registry = EventRegistry::new();
        let handle = registry.subscribe(EventKind::Processed, noop);

        let snapshot = registry.snapshot(EventKind::Processed).unwrap();
        registry.unsubscribe(handle);
        registry.subscribe(EventKind::Processed, noop);
        registry.subscribe(EventKind::Processed, noop);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].handle, handle);
        assert_eq!(registry.subscriber_count_for(EventKind::Processed), 2);
    }

    #[test]
    fn registrations_are_in_subscription_order_across_kinds() {
        let registry = EventRegistry::new();
        let a = registry.subscribe(EventKind::Verified, noop);
        let b = registry.subscribe(EventKind::Created, noop);
        let c = registry.subscribe(EventKind::Verified, noop);

        let order: Vec<_> = registry
            .registrations()
            .into_iter()
            .map(|registration| registration.handle)
            .collect();

        assert_eq!(order, vec![a, b, c]);
    }
}
