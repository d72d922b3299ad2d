use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::dispatcher::EventDispatcher;
use super::registry::{BoxError, EventRegistry, SubscriptionHandle, SubscriptionInfo};
use super::types::{ChannelUpdate, EventKind, ExpenseEvent};
use crate::Result;
use crate::auth::SessionTokenProvider;
use crate::error::Error;
use crate::ws::config::{Config, IdlePolicy};
use crate::ws::{Channel, Connection, ConnectionManager, ConnectionState, EventSink, WsError};

/// Updates a [`Client::stream`] buffers before its consumer starts lagging.
const STREAM_CAPACITY: usize = 1024;

/// Real-time expense lifecycle feed.
///
/// Wires an [`EventRegistry`], an [`EventDispatcher`] and a [`ConnectionManager`]
/// together for the [`Channel::EXPENSES`] channel. Subscribing opens the
/// authenticated connection on first use; registrations survive reconnects and
/// credential changes.
///
/// # Examples
///
/// ```rust, no_run
/// use std::sync::Arc;
///
/// use expense_feed_client::auth::{Credential, TokenStore};
/// use expense_feed_client::expenses::{ChannelUpdate, Client, EventKind};
/// use expense_feed_client::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let tokens = Arc::new(TokenStore::with_credential(Credential::new("session-token")));
///     let client = Client::new("wss://api.example.com/ws", Config::default(), tokens)?;
///
///     let handle = client.subscribe(EventKind::Verified, |update: &ChannelUpdate| {
///         if let ChannelUpdate::Event(event) = update {
///             println!("verified: {}", event.expense.id);
///         }
///         Ok(())
///     })?;
///
///     // ... later, when the view goes away
///     client.unsubscribe(handle);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    channel: Channel,
    registry: Arc<EventRegistry>,
    dispatcher: Arc<EventDispatcher>,
    connections: ConnectionManager,
}

impl Client {
    /// Create a client for `endpoint` (base `ws://` or `wss://` URL).
    ///
    /// Must be called from within a Tokio runtime. No connection is opened until
    /// the first subscription.
    pub fn new(
        endpoint: &str,
        config: Config,
        tokens: Arc<dyn SessionTokenProvider>,
    ) -> Result<Self> {
        let registry = Arc::new(EventRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
        let connections = ConnectionManager::new(
            endpoint,
            config,
            tokens,
            Arc::clone(&dispatcher) as Arc<dyn EventSink>,
        )?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                channel: Channel::EXPENSES,
                registry,
                dispatcher,
                connections,
            }),
        })
    }

    /// Register `callback` for `kind` and make sure the channel is connected.
    ///
    /// The callback receives matching events plus connection-level updates
    /// ([`ChannelUpdate::ConnectionError`], [`ChannelUpdate::ConnectionLost`]).
    ///
    /// # Errors
    ///
    /// Returns a [`Kind::Auth`](crate::error::Kind::Auth) error when no session
    /// credential is available. The registration is rolled back in that case.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&ChannelUpdate) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let handle = self.inner.registry.subscribe(kind, callback);

        if let Err(e) = self.inner.connections.acquire(&self.inner.channel) {
            self.inner.registry.unsubscribe(handle);
            return Err(e);
        }

        Ok(handle)
    }

    /// Remove one subscription. Unsubscribing twice is a no-op returning `false`.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.inner.registry.unsubscribe(handle);
        if removed {
            self.inner.apply_idle_policy();
        }
        removed
    }

    /// Remove every subscription of `kind`.
    pub fn unsubscribe_all(&self, kind: EventKind) -> usize {
        let removed = self.inner.registry.unsubscribe_all(kind);
        if removed > 0 {
            self.inner.apply_idle_policy();
        }
        removed
    }

    /// Subscribe to `kind` as a stream.
    ///
    /// Connection errors are yielded as `Err` items; the stream ends after the
    /// connection is lost for good. Dropping the stream unsubscribes.
    ///
    /// Up to 1024 updates are buffered. A consumer that falls further behind loses
    /// the oldest ones and receives a [`WsError::Lagged`] item instead.
    ///
    /// # Errors
    ///
    /// Same as [`Client::subscribe`].
    pub fn stream(&self, kind: EventKind) -> Result<impl Stream<Item = Result<ExpenseEvent>>> {
        let (tx, mut rx) = broadcast::channel(STREAM_CAPACITY);
        let handle = self.subscribe(kind, move |update: &ChannelUpdate| {
            // No receiver means the stream is being dropped, and the guard unsubscribes.
            tx.send(update.clone()).ok();
            Ok(())
        })?;

        let guard = StreamGuard {
            client: self.clone(),
            handle,
        };

        Ok(stream! {
            let _guard = guard;

            loop {
                match rx.recv().await {
                    Ok(ChannelUpdate::Event(event)) => yield Ok(event),
                    Ok(ChannelUpdate::ConnectionError { reason }) => {
                        yield Err(Error::from(WsError::ConnectionFailed(reason)));
                    }
                    Ok(ChannelUpdate::ConnectionLost { attempts }) => {
                        yield Err(Error::from(WsError::ConnectionLost { attempts }));
                        break;
                    }
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Expense stream lagged, missed {count} updates");
                        yield Err(Error::from(WsError::Lagged { count }));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Current state of the expenses connection.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connections.state(&self.inner.channel)
    }

    /// The live expenses connection, if any.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connections.connection(&self.inner.channel)
    }

    /// Get the number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.subscriber_count()
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.registry.active_subscriptions()
    }

    /// Close the connection while keeping every registration.
    ///
    /// The next [`Client::subscribe`] reconnects. Returns `true` if a live
    /// connection was closed.
    pub fn disconnect(&self) -> bool {
        self.inner.connections.release(&self.inner.channel)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }
}

impl ClientInner {
    fn apply_idle_policy(&self) {
        if self.connections.config().idle != IdlePolicy::CloseWhenIdle
            || self.registry.subscriber_count() > 0
        {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = %self.channel, "No subscribers left, closing connection");
        self.connections.release(&self.channel);
    }
}

/// Unsubscribes a [`Client::stream`] subscription when the stream is dropped.
struct StreamGuard {
    client: Client,
    handle: SubscriptionHandle,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.client.unsubscribe(self.handle);
    }
}
