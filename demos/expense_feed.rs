//! Expense feed explorer.
//!
//! Subscribes to every expense lifecycle event on the expenses channel, logs what
//! arrives, and optionally swaps the session credential half-way through to show
//! the connection being replaced.
//!
//! ```sh
//! EXPENSE_FEED_URL=wss://api.example.com/ws EXPENSE_FEED_TOKEN=... \
//!     RUST_LOG=info,expense_feed_client=debug cargo run --example expense_feed --features tracing
//! ```
//!
//! Set `EXPENSE_FEED_REFRESHED_TOKEN` to simulate a token refresh after 30 seconds.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use expense_feed_client::auth::{Credential, TokenStore};
use expense_feed_client::expenses::{ChannelUpdate, Client, EventKind};
use expense_feed_client::ws::config::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_ENDPOINT: &str = "wss://api.example.com/ws";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let endpoint = env::var("EXPENSE_FEED_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_owned());
    let tokens = Arc::new(TokenStore::new());
    if let Ok(token) = env::var("EXPENSE_FEED_TOKEN") {
        tokens.set(Credential::new(token));
    }

    let client = Client::new(
        &endpoint,
        Config::default(),
        Arc::<TokenStore>::clone(&tokens),
    )?;

    let mut handles = Vec::new();
    for kind in EventKind::ALL {
        let subscribed = client.subscribe(kind, move |update: &ChannelUpdate| {
            match update {
                ChannelUpdate::Event(event) => info!(
                    %kind,
                    id = %event.expense.id,
                    title = ?event.expense.title,
                    amount = ?event.expense.amount,
                    status = ?event.expense.status,
                    "expense event"
                ),
                ChannelUpdate::ConnectionError { reason } => warn!(%kind, %reason, "connection error"),
                ChannelUpdate::ConnectionLost { attempts } => warn!(%kind, attempts, "connection lost"),
                _ => {}
            }
            Ok(())
        });

        match subscribed {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                warn!(error = %e, "set EXPENSE_FEED_TOKEN to a session token");
                return Ok(());
            }
        }
    }
    info!(subscriptions = client.subscription_count(), "subscribed");

    if let Some(connection) = client.connection() {
        match connection.wait_connected().await {
            Ok(()) => info!(connection = %connection.id(), "connected"),
            Err(e) => warn!(error = %e, "unable to connect"),
        }
    }

    tokio::time::sleep(Duration::from_secs(30)).await;

    if let Ok(token) = env::var("EXPENSE_FEED_REFRESHED_TOKEN") {
        info!("refreshing session credential");
        tokens.set(Credential::new(token));
        info!(state = ?client.connection_state(), "connection replaced");
    }

    tokio::time::sleep(Duration::from_secs(30)).await;

    for handle in handles {
        client.unsubscribe(handle);
    }
    client.disconnect();
    info!(state = ?client.connection_state(), "done");

    Ok(())
}
