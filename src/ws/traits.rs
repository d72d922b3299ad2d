//! Core traits for the generic WebSocket layer.

use crate::error::Error;

/// Message parser trait for converting raw bytes to messages.
///
/// Implementations may return an empty vec when nothing in the frame is of
/// interest, and should accept both single objects and arrays of messages.
pub trait MessageParser<M>: Send + Sync + 'static {
    /// Parse incoming bytes into messages.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>>;
}

/// Receiver of everything a connection produces for its channel.
///
/// A connection calls [`EventSink::on_frame`] for each inbound text frame, in
/// transport order, from its own task. Connection-level failures that subscribers
/// must hear about are reported through [`EventSink::on_fault`].
pub trait EventSink: Send + Sync + 'static {
    /// Handle one inbound frame. Must not panic.
    fn on_frame(&self, frame: &[u8]);

    /// Surface a connection-level failure to subscribers.
    fn on_fault(&self, error: &Error);

    /// Whether anyone is currently listening on this sink.
    fn has_subscribers(&self) -> bool;
}
