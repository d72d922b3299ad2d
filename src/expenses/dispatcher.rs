#![expect(
    clippy::module_name_repetitions,
    reason = "EventDispatcher names its role next to the event types it routes"
)]

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;

use super::interest::{EventInterest, InterestTracker};
use super::registry::{EventRegistry, Registration, SubscriptionHandle};
use super::types::{ChannelUpdate, Envelope, EventKind, Expense, ExpenseEvent};
use crate::Result;
use crate::error::{Error, Kind};
use crate::serde_helpers::decode_payload;
use crate::ws::{EventSink, MessageParser, WsError};

/// Parse a text frame into the events of interest.
///
/// The frame is one envelope `{"event": "...", "data": {...}}` or an array of them.
/// Unknown event names and kinds outside `interest` are skipped without decoding
/// their payload. Anything else that does not decode rejects the whole frame with
/// [`WsError::MalformedEvent`].
pub fn parse_frame(bytes: &[u8], interest: EventInterest) -> Result<Vec<ExpenseEvent>> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;

    let envelopes = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut events = Vec::with_capacity(envelopes.len());
    for item in envelopes {
        let envelope: Envelope =
            serde_json::from_value(item).map_err(|e| malformed(e.to_string()))?;

        let Some(kind) = EventKind::from_event_name(&envelope.event) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(event = %envelope.event, "Skipping unknown event");
            continue;
        };
        if !interest.contains(EventInterest::from(kind)) {
            continue;
        }

        let expense: Expense = decode_payload(envelope.data)
            .map_err(|reason| malformed(format!("{kind} payload: {reason}")))?;
        events.push(ExpenseEvent::new(kind, expense));
    }

    Ok(events)
}

fn malformed(reason: String) -> Error {
    WsError::MalformedEvent { reason }.into()
}

/// [`MessageParser`] that only decodes events somebody is subscribed to.
#[derive(Debug, Clone)]
pub struct ExpenseParser {
    interest: Arc<InterestTracker>,
}

impl ExpenseParser {
    /// Parser that follows the interest set of `registry`.
    #[must_use]
    pub fn new(registry: &EventRegistry) -> Self {
        Self {
            interest: registry.interest_tracker(),
        }
    }
}

impl MessageParser<ExpenseEvent> for ExpenseParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<ExpenseEvent>> {
        parse_frame(bytes, self.interest.get())
    }
}

/// A subscriber callback returned an error or panicked.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SubscriberError {
    /// Subscription whose callback failed
    pub subscription: SubscriptionHandle,
    pub reason: String,
}

impl fmt::Display for SubscriberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber {} failed: {}", self.subscription, self.reason)
    }
}

impl StdError for SubscriberError {}

impl From<SubscriberError> for Error {
    fn from(err: SubscriberError) -> Self {
        Error::with_source(Kind::Subscriber, err)
    }
}

/// Outcome of routing one frame or update.
#[non_exhaustive]
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Events decoded from the frame
    pub events: usize,
    /// Callback invocations that completed normally
    pub delivered: usize,
    /// Callbacks that failed; the remaining callbacks still ran
    pub failures: Vec<SubscriberError>,
}

impl DispatchReport {
    /// Turn the first callback failure, if any, into a
    /// [`Kind::Subscriber`](crate::error::Kind::Subscriber) error.
    ///
    /// # Errors
    ///
    /// Returns the first [`SubscriberError`] when at least one callback failed.
    pub fn into_result(mut self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(self.failures.swap_remove(0).into())
        }
    }

    fn merge(&mut self, other: DispatchReport) {
        self.events += other.events;
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

/// Routes decoded events to the callbacks registered in an [`EventRegistry`].
///
/// Every callback is isolated: an `Err` or a panic is caught, logged and reported
/// as a [`SubscriberError`], and dispatch continues with the next callback.
pub struct EventDispatcher {
    registry: Arc<EventRegistry>,
    parser: ExpenseParser,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        let parser = ExpenseParser::new(&registry);
        Self { registry, parser }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Decode an inbound text frame and dispatch every event in it.
    ///
    /// A malformed frame is rejected whole: no callback runs.
    pub fn dispatch_frame(&self, bytes: &[u8]) -> Result<DispatchReport> {
        let events = self.parser.parse(bytes)?;

        let mut report = DispatchReport::default();
        for event in events {
            report.merge(self.dispatch(event));
        }
        Ok(report)
    }

    /// Deliver one event to the subscribers of its kind, in registration order.
    pub fn dispatch(&self, event: ExpenseEvent) -> DispatchReport {
        let Some(registrations) = self.registry.snapshot(event.kind) else {
            return DispatchReport {
                events: 1,
                ..DispatchReport::default()
            };
        };

        let update = ChannelUpdate::Event(event);
        let mut report = deliver(registrations.iter(), &update);
        report.events = 1;
        report
    }

    /// Deliver a connection-level update once to every subscription, in registration order.
    pub fn broadcast(&self, update: &ChannelUpdate) -> DispatchReport {
        let registrations = self.registry.registrations();

        #[cfg(feature = "tracing")]
        tracing::debug!(?update, subscribers = registrations.len(), "Broadcasting update");

        deliver(registrations.iter(), update)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn deliver<'reg, I>(registrations: I, update: &ChannelUpdate) -> DispatchReport
where
    I: Iterator<Item = &'reg Registration>,
{
    let mut report = DispatchReport::default();

    for registration in registrations {
        let outcome = catch_unwind(AssertUnwindSafe(|| (registration.callback)(update)));

        let reason = match outcome {
            Ok(Ok(())) => {
                report.delivered += 1;
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(&*panic)),
        };

        let failure = SubscriberError {
            subscription: registration.handle,
            reason,
        };
        #[cfg(feature = "tracing")]
        tracing::warn!(subscription = %failure.subscription, reason = %failure.reason, "Subscriber failed");
        report.failures.push(failure);
    }

    report
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

impl EventSink for EventDispatcher {
    fn on_frame(&self, frame: &[u8]) {
        match self
            .dispatch_frame(frame)
            .and_then(DispatchReport::into_result)
        {
            Ok(report) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(
                    events = report.events,
                    delivered = report.delivered,
                    "Dispatched frame"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &report;
            }
            // Each failure was already logged while delivering.
            Err(e) if e.kind() == Kind::Subscriber => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Frame dispatched with failing subscribers");
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn on_fault(&self, error: &Error) {
        let update = match error.downcast_ref::<WsError>() {
            Some(WsError::ConnectionLost { attempts }) => ChannelUpdate::ConnectionLost {
                attempts: *attempts,
            },
            _ => ChannelUpdate::ConnectionError {
                reason: error
                    .inner()
                    .map_or_else(|| error.to_string(), ToString::to_string),
            },
        };
        self.broadcast(&update);
    }

    fn has_subscribers(&self) -> bool {
        self.registry.subscriber_count() > 0
    }
}
