#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::config::Config;
use super::error::WsError;
use super::manager::Channel;
use super::reconnect::ReconnectPolicy;
use super::traits::EventSink;
use crate::Result;
use crate::auth::{Credential, SessionTokenProvider};
use crate::error::{Error, Kind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live connection
    Absent,
    /// Handshake in progress
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was (re-)established
        since: Instant,
    },
    /// Re-establishing a dropped connection
    Reconnecting {
        /// Current reconnection attempt number, starting at 1
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if the connection has ended (or never existed).
    #[must_use]
    pub const fn is_absent(self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Handle to one live, authenticated socket for a [`Channel`].
///
/// Connections are created and torn down only by
/// [`ConnectionManager`](super::ConnectionManager). The credential a connection was
/// opened with never changes; a new credential means a new connection. Clones share
/// the same underlying transport task and compare equal through [`Connection::id`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: Uuid,
    channel: Channel,
    credential: Credential,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

/// Everything a transport task needs besides its identity.
pub(crate) struct ConnectionParams {
    pub(crate) endpoint: Url,
    pub(crate) tokens: Arc<dyn SessionTokenProvider>,
    pub(crate) config: Config,
    pub(crate) sink: Arc<dyn EventSink>,
}

impl Connection {
    /// Spawn the transport task on `runtime` and return its handle in the
    /// [`ConnectionState::Connecting`] state.
    pub(crate) fn open(
        channel: Channel,
        credential: Credential,
        params: ConnectionParams,
        runtime: &Handle,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            channel = %channel,
            connection = %id,
            endpoint = %params.endpoint,
            "Opening connection"
        );

        let task = ConnectionTask {
            id,
            channel: channel.clone(),
            credential: credential.clone(),
            params,
            state_tx: state_tx.clone(),
            cancel: cancel.clone(),
        };
        runtime.spawn(task.run());

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                channel,
                credential,
                state_tx,
                state_rx,
                cancel,
            }),
        }
    }

    /// Unique identity of this connection instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Channel this connection serves.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the handshake completes.
    ///
    /// Fails with [`WsError::Released`] if the connection was released first, or with
    /// [`WsError::ConnectionFailed`] if the handshake failed.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state_rx = self.state_receiver();
        let state = *state_rx
            .wait_for(|state| state.is_connected() || state.is_absent())
            .await
            .map_err(|e| Error::with_source(Kind::Internal, e))?;

        if state.is_connected() {
            Ok(())
        } else if self.inner.cancel.is_cancelled() {
            Err(WsError::Released.into())
        } else {
            Err(WsError::ConnectionFailed(format!(
                "connection to channel `{}` ended before it was established",
                self.inner.channel
            ))
            .into())
        }
    }

    pub(crate) fn credential(&self) -> &Credential {
        &self.inner.credential
    }

    /// Cancel the transport task, including an in-flight handshake.
    pub(crate) fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.state_tx.send_replace(ConnectionState::Absent);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct ConnectionTask {
    #[cfg_attr(
        not(feature = "tracing"),
        expect(dead_code, reason = "Only read by log statements")
    )]
    id: Uuid,
    #[cfg_attr(
        not(feature = "tracing"),
        expect(dead_code, reason = "Only read by log statements")
    )]
    channel: Channel,
    credential: Credential,
    params: ConnectionParams,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(self) {
        let released = self
            .cancel
            .run_until_cancelled(self.lifecycle())
            .await
            .is_none();

        #[cfg(feature = "tracing")]
        if released {
            tracing::debug!(channel = %self.channel, connection = %self.id, "Connection released");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = released;

        self.state_tx.send_replace(ConnectionState::Absent);
    }

    /// Publish a state unless the connection has been released.
    ///
    /// Runs under the watch lock so it cannot overwrite the `Absent` written by
    /// [`Connection::close`].
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if self.cancel.is_cancelled() || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Forward a fault to the sink unless the connection has been released.
    fn report(&self, error: &Error) {
        if self.cancel.is_cancelled() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                channel = %self.channel,
                connection = %self.id,
                %error,
                "Fault after release discarded"
            );
            return;
        }
        self.params.sink.on_fault(error);
    }

    async fn lifecycle(&self) {
        let mut ws = match self.connect(&self.credential).await {
            Ok(ws) => ws,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(channel = %self.channel, error = %e, "Unable to connect");
                self.set_state(ConnectionState::Absent);
                self.report(&e);
                return;
            }
        };

        let mut policy = ReconnectPolicy::new(self.params.config.reconnect.clone());

        loop {
            self.set_state(ConnectionState::Connected {
                since: Instant::now(),
            });

            let reason = self.handle_connection(ws).await;
            #[cfg(feature = "tracing")]
            tracing::warn!(channel = %self.channel, connection = %self.id, %reason, "Connection dropped");
            #[cfg(not(feature = "tracing"))]
            let _ = &reason;

            ws = match self.reconnect(&mut policy).await {
                Some(ws) => ws,
                None => return,
            };
            policy.reset();

            // Registrations live outside the connection, so every listener is already armed.
            #[cfg(feature = "tracing")]
            tracing::info!(
                channel = %self.channel,
                connection = %self.id,
                subscribers = self.params.sink.has_subscribers(),
                "Reconnected"
            );
        }
    }

    /// Retry with backoff until connected, superseded, or out of attempts.
    async fn reconnect(&self, policy: &mut ReconnectPolicy) -> Option<WsStream> {
        loop {
            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt();
                #[cfg(feature = "tracing")]
                tracing::error!(channel = %self.channel, attempts, "Giving up on reconnection");
                self.set_state(ConnectionState::Absent);
                self.report(&WsError::ConnectionLost { attempts }.into());
                return None;
            };

            self.set_state(ConnectionState::Reconnecting {
                attempt: policy.attempt(),
            });
            sleep(delay).await;

            // Always use the store's current credential. If it no longer matches this
            // connection's snapshot, the manager is replacing the connection.
            let current = match self.params.tokens.token() {
                Some(current) if current == self.credential => current,
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        channel = %self.channel,
                        connection = %self.id,
                        "Credential changed during reconnect, connection superseded"
                    );
                    return None;
                }
            };

            match self.connect(&current).await {
                Ok(ws) => return Some(ws),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        channel = %self.channel,
                        attempt = policy.attempt(),
                        error = %e,
                        "Reconnection attempt failed"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
    }

    async fn connect(&self, credential: &Credential) -> Result<WsStream> {
        let mut request = self.params.endpoint.as_str().into_client_request()?;
        let mut bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|e| Error::with_source(Kind::Validation, e))?;
        bearer.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _) = connect_async(request).await?;
        Ok(ws)
    }

    /// Pump an established connection until the transport drops.
    async fn handle_connection(&self, ws: WsStream) -> WsError {
        let (mut write, mut read) = ws.split();

        let period = self.params.config.heartbeat_interval;
        let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");
                            self.params.sink.on_frame(text.as_bytes());
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = None;
                        }
                        Some(Ok(Message::Close(_))) | None => return WsError::ConnectionClosed,
                        Some(Err(e)) => return WsError::Connection(e),
                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol; pings are answered by tungstenite.
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(sent) = awaiting_pong
                        && sent.elapsed() >= self.params.config.heartbeat_timeout
                    {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            "Heartbeat timeout: no PONG received within {:?}",
                            self.params.config.heartbeat_timeout
                        );
                        return WsError::Timeout;
                    }

                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return WsError::ConnectionClosed;
                    }
                    awaiting_pong.get_or_insert_with(Instant::now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::auth::TokenStore;

    #[derive(Default)]
    struct FaultLog {
        faults: Mutex<Vec<String>>,
    }

    impl EventSink for FaultLog {
        fn on_frame(&self, _frame: &[u8]) {}

        fn on_fault(&self, error: &Error) {
            self.faults.lock().unwrap().push(error.to_string());
        }

        fn has_subscribers(&self) -> bool {
            true
        }
    }

    fn task(sink: Arc<FaultLog>) -> ConnectionTask {
        let credential = Credential::new("token");
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        ConnectionTask {
            id: Uuid::new_v4(),
            channel: Channel::EXPENSES,
            credential: credential.clone(),
            params: ConnectionParams {
                endpoint: Url::parse("ws://127.0.0.1:1/expenses").unwrap(),
                tokens: Arc::new(TokenStore::with_credential(credential)),
                config: Config::default(),
                sink,
            },
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn faults_reach_the_sink_while_live() {
        let sink = Arc::new(FaultLog::default());
        let task = task(Arc::clone(&sink));

        task.report(&WsError::ConnectionLost { attempts: 2 }.into());

        assert_eq!(sink.faults.lock().unwrap().len(), 1);
    }

    #[test]
    fn faults_after_release_are_discarded() {
        let sink = Arc::new(FaultLog::default());
        let task = task(Arc::clone(&sink));
        task.cancel.cancel();

        task.report(&WsError::ConnectionLost { attempts: 2 }.into());
        task.set_state(ConnectionState::Connected {
            since: Instant::now(),
        });

        assert!(sink.faults.lock().unwrap().is_empty());
        assert_eq!(*task.state_tx.borrow(), ConnectionState::Connecting);
    }
}
