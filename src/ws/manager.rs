#![expect(
    clippy::module_name_repetitions,
    reason = "ConnectionManager is the public name of the connection owner"
)]

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet, Entry};
use tokio::runtime::Handle;
use url::Url;

use super::config::Config;
use super::connection::{Connection, ConnectionParams, ConnectionState};
use super::traits::EventSink;
use crate::Result;
use crate::auth::{Credential, ListenerId, SessionTokenProvider};
use crate::error::Error;

/// Logical socket namespace. Each channel maps to at most one live [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel(Cow<'static, str>);

impl Channel {
    /// The expense lifecycle channel.
    pub const EXPENSES: Channel = Channel(Cow::Borrowed("expenses"));

    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(Cow::Owned(name.into()))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owns the live connection of every channel.
///
/// - [`ConnectionManager::acquire`] lazily creates the connection with the current
///   credential; callers racing on the same channel get the same instance.
/// - [`ConnectionManager::release`] tears it down explicitly.
/// - A credential change replaces the connection of every channel served since its
///   last release, live or not, and re-acquires it right away when the sink still
///   has subscribers.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    /// Base endpoint, each channel name is appended as a path segment
    base: Url,
    config: Config,
    tokens: Arc<dyn SessionTokenProvider>,
    sink: Arc<dyn EventSink>,
    runtime: Handle,
    connections: DashMap<Channel, Connection>,
    /// Channels acquired and not explicitly released since. Survives logout,
    /// failed handshakes and exhausted reconnects so a new credential restores them.
    served: DashSet<Channel>,
    listener: ListenerId,
}

impl ConnectionManager {
    /// Create a manager for `endpoint` (a `ws://` or `wss://` URL).
    ///
    /// Must be called from within a Tokio runtime; connection tasks are spawned on it.
    /// No connection is opened until [`ConnectionManager::acquire`].
    pub fn new(
        endpoint: &str,
        config: Config,
        tokens: Arc<dyn SessionTokenProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let base = Url::parse(endpoint)?;
        if !matches!(base.scheme(), "ws" | "wss") || base.cannot_be_a_base() {
            return Err(Error::validation(format!(
                "endpoint must be a ws:// or wss:// URL, got `{endpoint}`"
            )));
        }
        let runtime = Handle::try_current()?;

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let weak = Weak::clone(weak);
            let listener = tokens.on_change(Box::new(move |credential: Option<&Credential>| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_credential_change(credential);
                }
            }));

            ManagerInner {
                base,
                config,
                tokens,
                sink,
                runtime,
                connections: DashMap::new(),
                served: DashSet::new(),
                listener,
            }
        });

        Ok(Self { inner })
    }

    /// Return the live connection for `channel`, creating it if absent.
    ///
    /// Fails with [`Kind::Auth`](crate::error::Kind::Auth) when no credential is
    /// available; nothing is created and no transport attempt is made in that case.
    /// The returned connection may still be handshaking, see
    /// [`Connection::wait_connected`].
    pub fn acquire(&self, channel: &Channel) -> Result<Connection> {
        self.inner.acquire(channel)
    }

    /// Close and discard the connection for `channel`.
    ///
    /// Returns `true` if a live connection was torn down. An in-flight handshake is
    /// cancelled and its result discarded. A released channel is no longer restored
    /// on credential changes until it is acquired again.
    pub fn release(&self, channel: &Channel) -> bool {
        self.inner.release(channel)
    }

    /// Current state of `channel`, [`ConnectionState::Absent`] when it has no connection.
    #[must_use]
    pub fn state(&self, channel: &Channel) -> ConnectionState {
        self.inner
            .connections
            .get(channel)
            .map_or(ConnectionState::Absent, |connection| connection.state())
    }

    /// The live connection for `channel`, without creating one.
    #[must_use]
    pub fn connection(&self, channel: &Channel) -> Option<Connection> {
        self.inner
            .connections
            .get(channel)
            .filter(|connection| !connection.state().is_absent())
            .map(|connection| connection.value().clone())
    }

    /// Configuration shared by every connection.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl ManagerInner {
    fn acquire(&self, channel: &Channel) -> Result<Connection> {
        self.served.insert(channel.clone());
        let entry = self.connections.entry(channel.clone());

        if let Entry::Occupied(existing) = &entry
            && !existing.get().state().is_absent()
        {
            return Ok(existing.get().clone());
        }

        let Some(credential) = self.tokens.token() else {
            if let Entry::Occupied(stale) = entry {
                stale.remove();
            }
            #[cfg(feature = "tracing")]
            tracing::warn!(channel = %channel, "No session credential, not connecting");
            return Err(Error::auth_required(channel.name()));
        };

        let connection = Connection::open(
            channel.clone(),
            credential,
            ConnectionParams {
                endpoint: self.channel_endpoint(channel)?,
                tokens: Arc::clone(&self.tokens),
                config: self.config.clone(),
                sink: Arc::clone(&self.sink),
            },
            &self.runtime,
        );
        entry.insert(connection.clone());

        Ok(connection)
    }

    fn release(&self, channel: &Channel) -> bool {
        self.served.remove(channel);
        let Some((_, connection)) = self.connections.remove(channel) else {
            return false;
        };

        let live = !connection.state().is_absent();
        connection.close();

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = %channel, connection = %connection.id(), live, "Released connection");

        live
    }

    fn on_credential_change(&self, credential: Option<&Credential>) {
        let channels: Vec<Channel> = self
            .served
            .iter()
            .map(|channel| channel.key().clone())
            .collect();

        for channel in channels {
            // A refresh that hands back the same token leaves a live connection alone.
            let stale = self.connections.remove_if(&channel, |_, connection| {
                connection.state().is_absent() || credential != Some(connection.credential())
            });
            let was_live = match stale {
                Some((_, stale)) => {
                    let live = !stale.state().is_absent();
                    stale.close();
                    live
                }
                None if self.connections.contains_key(&channel) => continue,
                None => false,
            };

            if !self.sink.has_subscribers() {
                #[cfg(feature = "tracing")]
                tracing::debug!(channel = %channel, "Credential changed, connection released");
                continue;
            }

            if credential.is_none() {
                #[cfg(feature = "tracing")]
                tracing::info!(channel = %channel, "Credential cleared, waiting for a new one");
                if was_live {
                    self.sink.on_fault(&Error::auth_required(channel.name()));
                }
                continue;
            }

            #[cfg(feature = "tracing")]
            tracing::info!(channel = %channel, was_live, "Credential changed, reconnecting");

            if let Err(e) = self.acquire(&channel) {
                self.sink.on_fault(&e);
            }
        }
    }

    fn channel_endpoint(&self, channel: &Channel) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::validation("endpoint cannot carry a channel path"))?
            .pop_if_empty()
            .push(channel.name());
        Ok(url)
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.tokens.remove_listener(self.listener);
        for entry in &self.connections {
            entry.value().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::auth::TokenStore;
    use crate::error::Kind;

    #[derive(Default)]
    struct NullSink {
        subscribed: AtomicBool,
    }

    impl EventSink for NullSink {
        fn on_frame(&self, _frame: &[u8]) {}

        fn on_fault(&self, _error: &Error) {}

        fn has_subscribers(&self) -> bool {
            self.subscribed.load(Ordering::SeqCst)
        }
    }

    fn manager(endpoint: &str, tokens: Arc<TokenStore>) -> Result<ConnectionManager> {
        ConnectionManager::new(
            endpoint,
            Config::default(),
            tokens,
            Arc::new(NullSink::default()),
        )
    }

    fn subscribed_manager(tokens: Arc<TokenStore>) -> ConnectionManager {
        let sink = NullSink::default();
        sink.subscribed.store(true, Ordering::SeqCst);
        ConnectionManager::new("ws://127.0.0.1:1", Config::default(), tokens, Arc::new(sink))
            .unwrap()
    }

    fn current_id(manager: &ConnectionManager) -> Option<Uuid> {
        manager
            .inner
            .connections
            .get(&Channel::EXPENSES)
            .map(|connection| connection.id())
    }

    #[tokio::test]
    async fn rejects_non_websocket_endpoint() {
        let err = manager("https://example.com", Arc::new(TokenStore::new()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn requires_runtime() {
        let err = manager("ws://127.0.0.1:1", Arc::new(TokenStore::new()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), Kind::Internal);
    }

    #[tokio::test]
    async fn channel_is_appended_to_endpoint() {
        let tokens = Arc::new(TokenStore::new());
        let manager = manager("wss://api.example.com/socket/", tokens).unwrap();

        let url = manager.inner.channel_endpoint(&Channel::EXPENSES).unwrap();

        assert_eq!(url.as_str(), "wss://api.example.com/socket/expenses");
    }

    #[tokio::test]
    async fn acquire_without_credential_creates_nothing() {
        let tokens = Arc::new(TokenStore::new());
        let manager = manager("ws://127.0.0.1:1", tokens).unwrap();

        let err = manager.acquire(&Channel::EXPENSES).unwrap_err();

        assert_eq!(err.kind(), Kind::Auth);
        assert!(manager.connection(&Channel::EXPENSES).is_none());
        assert_eq!(manager.state(&Channel::EXPENSES), ConnectionState::Absent);
    }

    #[tokio::test]
    async fn dropping_manager_unregisters_listener() {
        let tokens = Arc::new(TokenStore::new());
        let manager = manager("ws://127.0.0.1:1", Arc::clone(&tokens)).unwrap();
        assert_eq!(tokens.listener_count(), 1);

        drop(manager);

        assert_eq!(tokens.listener_count(), 0);
    }

    #[tokio::test]
    async fn login_after_logout_restores_served_channel() {
        let tokens = Arc::new(TokenStore::with_credential(Credential::new("a")));
        let manager = subscribed_manager(Arc::clone(&tokens));
        let first = manager.acquire(&Channel::EXPENSES).unwrap().id();

        tokens.clear();
        assert_eq!(current_id(&manager), None);

        tokens.set(Credential::new("b"));
        let restored = current_id(&manager).expect("channel should be re-acquired");
        assert_ne!(restored, first);
    }

    #[tokio::test]
    async fn released_channel_is_not_restored() {
        let tokens = Arc::new(TokenStore::with_credential(Credential::new("a")));
        let manager = subscribed_manager(Arc::clone(&tokens));
        manager.acquire(&Channel::EXPENSES).unwrap();

        assert!(manager.release(&Channel::EXPENSES));
        tokens.set(Credential::new("b"));

        assert_eq!(current_id(&manager), None);
    }

    #[tokio::test]
    async fn same_token_keeps_live_connection() {
        let tokens = Arc::new(TokenStore::with_credential(Credential::new("a")));
        let manager = subscribed_manager(Arc::clone(&tokens));
        let first = manager.acquire(&Channel::EXPENSES).unwrap().id();

        tokens.set(Credential::new("a"));

        assert_eq!(current_id(&manager), Some(first));
    }
}
