//! Streams verified expenses until the connection is lost or ten events arrive.
//!
//! ```sh
//! EXPENSE_FEED_URL=wss://api.example.com/ws EXPENSE_FEED_TOKEN=... \
//!     RUST_LOG=info cargo run --example expense_stream --features tracing
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use expense_feed_client::auth::{Credential, TokenStore};
use expense_feed_client::expenses::{Client, EventKind};
use expense_feed_client::ws::config::Config;
use futures::StreamExt as _;
use tokio::time::timeout;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let endpoint =
        env::var("EXPENSE_FEED_URL").unwrap_or_else(|_| "wss://api.example.com/ws".to_owned());
    let token = env::var("EXPENSE_FEED_TOKEN")?;
    let tokens = Arc::new(TokenStore::with_credential(Credential::new(token)));

    let client = Client::new(&endpoint, Config::default(), tokens)?;
    let mut stream = Box::pin(client.stream(EventKind::Verified)?);

    let mut count = 0;
    while let Ok(Some(result)) = timeout(Duration::from_secs(60), stream.next()).await {
        match result {
            Ok(event) => {
                info!(
                    stream = "expense-verified",
                    id = %event.expense.id,
                    amount = ?event.expense.amount,
                    currency = ?event.expense.currency
                );
                count += 1;
                if count >= 10 {
                    break;
                }
            }
            Err(e) => debug!(stream = "expense-verified", error = %e),
        }
    }
    info!(stream = "expense-verified", received = count);

    Ok(())
}
