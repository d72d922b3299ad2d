#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// A connection could not be established; carries the transport's reason
    ConnectionFailed(String),
    /// WebSocket connection was closed by the server or the transport
    ConnectionClosed,
    /// The connection was released before it could be established
    Released,
    /// No PONG arrived within the heartbeat timeout
    Timeout,
    /// An inbound frame could not be decoded into an expense event
    MalformedEvent {
        /// Why the frame was rejected
        reason: String,
    },
    /// A stream consumer fell behind and missed updates
    Lagged {
        /// Number of updates that were dropped
        count: u64,
    },
    /// Reconnection gave up after exhausting its retry budget
    ConnectionLost {
        /// Number of reconnection attempts that were made
        attempts: u32,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectionFailed(reason) => write!(f, "WebSocket connection failed: {reason}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Released => write!(f, "WebSocket connection released"),
            Self::Timeout => write!(f, "WebSocket heartbeat timed out"),
            Self::MalformedEvent { reason } => write!(f, "Malformed event frame: {reason}"),
            Self::Lagged { count } => write!(f, "Subscription lagged, missed {count} updates"),
            Self::ConnectionLost { attempts } => {
                write!(f, "WebSocket connection lost after {attempts} reconnection attempts")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[test]
    fn connection_lost_display() {
        let err = WsError::ConnectionLost { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "WebSocket connection lost after 3 reconnection attempts"
        );
    }

    #[test]
    fn converts_into_websocket_kind() {
        let error: Error = WsError::MalformedEvent {
            reason: "missing field `event`".to_owned(),
        }
        .into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::MalformedEvent { .. })
        ));
    }
}
