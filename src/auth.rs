//! Session credentials and change notifications.
//!
//! The credential store itself belongs to the host application. This module
//! defines the [`SessionTokenProvider`] seam the connection layer reads from,
//! and [`TokenStore`], an in-memory implementation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Opaque bearer token used to authenticate socket connections.
///
/// Credentials are replaced wholesale on login, refresh and logout; they are never
/// partially updated. The token is redacted from [`fmt::Debug`] output.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Credential {
    token: SecretString,
}

impl Credential {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// Returns the bearer token.
    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Value of the `Authorization` header sent at connect time.
    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.token.expose_secret() == other.token.expose_secret()
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.token)
            .finish()
    }
}

/// Identifies a listener registered through [`SessionTokenProvider::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked with the new credential (`None` after logout).
pub type ChangeListener = Box<dyn Fn(Option<&Credential>) + Send + Sync>;

/// Source of the current session credential.
///
/// Implementations notify listeners synchronously, after the new value is visible
/// through [`SessionTokenProvider::token`].
pub trait SessionTokenProvider: Send + Sync {
    /// The current credential, if a session is active.
    fn token(&self) -> Option<Credential>;

    /// Register a listener for credential changes (login, refresh, logout).
    fn on_change(&self, listener: ChangeListener) -> ListenerId;

    /// Remove a listener. Removing an unknown id is a no-op.
    fn remove_listener(&self, id: ListenerId);
}

/// In-memory [`SessionTokenProvider`].
///
/// ```
/// use expense_feed_client::auth::{Credential, SessionTokenProvider as _, TokenStore};
///
/// let store = TokenStore::new();
/// assert!(store.token().is_none());
///
/// store.set(Credential::new("token-a"));
/// assert_eq!(store.token(), Some(Credential::new("token-a")));
/// ```
#[derive(Default)]
pub struct TokenStore {
    current: RwLock<Option<Credential>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Fn(Option<&Credential>) + Send + Sync>)>>,
    next_listener: AtomicU64,
}

impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a credential.
    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::new();
        *store
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential);
        store
    }

    /// Replace the credential (login or refresh) and notify listeners.
    pub fn set(&self, credential: Credential) {
        self.replace(Some(credential));
    }

    /// Remove the credential (logout) and notify listeners.
    pub fn clear(&self) {
        self.replace(None);
    }

    fn replace(&self, credential: Option<Credential>) {
        // Option<Credential> has no inconsistent intermediate state, so a poisoned lock is safe to reuse.
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credential.clone();

        // Listeners run without the lock held so they can read the store or unregister.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            listeners = listeners.len(),
            present = credential.is_some(),
            "Session credential changed"
        );

        for listener in listeners {
            listener(credential.as_ref());
        }
    }

    /// Number of registered change listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl SessionTokenProvider for TokenStore {
    fn token(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_change(&self, listener: ChangeListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::from(listener)));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener_id, _)| *listener_id != id);
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("current", &self.token())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn debug_redacts_token() {
        let credential = Credential::new("super-secret");
        let debug = format!("{credential:?}");

        assert!(!debug.contains("super-secret"), "token leaked: {debug}");
    }

    #[test]
    fn bearer_header_value() {
        assert_eq!(Credential::new("abc").bearer(), "Bearer abc");
    }

    #[test]
    fn listeners_observe_set_and_clear() {
        let store = TokenStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        store.on_change(Box::new(move |credential: Option<&Credential>| {
            sink.lock()
                .unwrap()
                .push(credential.map(|c| c.token().expose_secret().to_owned()));
        }));

        store.set(Credential::new("first"));
        store.set(Credential::new("second"));
        store.clear();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("first".to_owned()), Some("second".to_owned()), None]
        );
    }

    #[test]
    fn listener_sees_new_value_through_store() {
        let store = Arc::new(TokenStore::new());
        let observed = Arc::new(Mutex::new(None));

        let reader = Arc::clone(&store);
        let sink = Arc::clone(&observed);
        store.on_change(Box::new(move |_| {
            *sink.lock().unwrap() = reader.token();
        }));

        store.set(Credential::new("fresh"));

        assert_eq!(*observed.lock().unwrap(), Some(Credential::new("fresh")));
    }

    #[test]
    fn remove_listener_is_idempotent() {
        let store = TokenStore::new();
        let id = store.on_change(Box::new(|_| {}));
        assert_eq!(store.listener_count(), 1);

        store.remove_listener(id);
        store.remove_listener(id);
        assert_eq!(store.listener_count(), 0);
    }
}
