#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test file uses every helper"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use expense_feed_client::expenses::{BoxError, ChannelUpdate};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

pub const TOKEN_A: &str = "token-a";
pub const TOKEN_B: &str = "token-b";

/// How long a test waits for something that should happen.
pub const WAIT: Duration = Duration::from_secs(2);
/// How long a test waits to be sure something does not happen.
pub const QUIET: Duration = Duration::from_millis(300);

/// What the server saw during one WebSocket handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub path: String,
    pub authorization: Option<String>,
}

/// Mock expenses socket server.
///
/// Records every handshake, broadcasts frames to every connected client, can drop
/// all live connections, and can refuse new ones (TCP accepted then closed) to make
/// reconnection attempts fail. New connections can also be left hanging before the
/// handshake, or accepted without ever being read so pings go unanswered.
pub struct MockFeedServer {
    addr: SocketAddr,
    /// Frames for ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Closes every live connection
    disconnect_tx: broadcast::Sender<()>,
    handshake_rx: mpsc::UnboundedReceiver<Handshake>,
    handshakes: Arc<AtomicUsize>,
    refused: Arc<AtomicUsize>,
    refusing: Arc<AtomicBool>,
    stalled: Arc<AtomicUsize>,
    stalling: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
}

impl MockFeedServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (disconnect_tx, _) = broadcast::channel::<()>(8);
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel::<Handshake>();
        let handshakes = Arc::new(AtomicUsize::new(0));
        let refused = Arc::new(AtomicUsize::new(0));
        let refusing = Arc::new(AtomicBool::new(false));
        let stalled = Arc::new(AtomicUsize::new(0));
        let stalling = Arc::new(AtomicBool::new(false));
        let muted = Arc::new(AtomicBool::new(false));

        let broadcast_tx = message_tx.clone();
        let disconnect = disconnect_tx.clone();
        let handshake_count = Arc::clone(&handshakes);
        let refused_count = Arc::clone(&refused);
        let refuse = Arc::clone(&refusing);
        let stalled_count = Arc::clone(&stalled);
        let stall = Arc::clone(&stalling);
        let mute = Arc::clone(&muted);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                if refuse.load(Ordering::SeqCst) {
                    refused_count.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                    continue;
                }

                if stall.load(Ordering::SeqCst) {
                    stalled_count.fetch_add(1, Ordering::SeqCst);
                    let mut disconnect_rx = disconnect.subscribe();
                    tokio::spawn(async move {
                        // Hold the socket open without answering the upgrade request.
                        let _stream = stream;
                        disconnect_rx.recv().await.ok();
                    });
                    continue;
                }

                // Subscribe before the handshake completes so no frame sent after
                // `wait_connected` can be missed.
                let mut msg_rx = broadcast_tx.subscribe();
                let mut disconnect_rx = disconnect.subscribe();

                let tx = handshake_tx.clone();
                let count = Arc::clone(&handshake_count);
                let callback = move |request: &Request, response: Response| {
                    count.fetch_add(1, Ordering::SeqCst);
                    drop(tx.send(Handshake {
                        path: request.uri().path().to_owned(),
                        authorization: request
                            .headers()
                            .get(AUTHORIZATION)
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_owned),
                    }));
                    Ok::<_, ErrorResponse>(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let reading = !mute.load(Ordering::SeqCst);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next(), if reading => {
                                match msg {
                                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            _ = disconnect_rx.recv() => break,
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            disconnect_tx,
            handshake_rx,
            handshakes,
            refused,
            refusing,
            stalled,
            stalling,
            muted,
        }
    }

    /// Base endpoint; the client appends the channel name.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a frame to all connected clients.
    pub fn send(&self, frame: &str) {
        drop(self.message_tx.send(frame.to_owned()));
    }

    /// Send a `{"event", "data"}` envelope to all connected clients.
    pub fn send_event(&self, event: &str, data: Value) {
        self.send(&json!({ "event": event, "data": data }).to_string());
    }

    /// Drop every live connection.
    pub fn disconnect_all(&self) {
        drop(self.disconnect_tx.send(()));
    }

    /// Close new TCP connections before the WebSocket handshake.
    pub fn refuse_connections(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }

    pub fn accept_connections(&self) {
        self.refusing.store(false, Ordering::SeqCst);
    }

    /// Accept new TCP connections but never answer their upgrade request.
    pub fn stall_handshakes(&self) {
        self.stalling.store(true, Ordering::SeqCst);
    }

    /// Complete handshakes for new connections but never read from them, so
    /// client pings get no pong.
    pub fn mute_connections(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    /// Wait until `count` connections are hanging before their handshake.
    pub async fn wait_for_stalled(&self, count: usize) {
        timeout(WAIT, async {
            while self.stalled.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for a stalled handshake");
    }

    /// Completed handshakes so far.
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Connections refused so far.
    pub fn refused_count(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }

    /// Wait for the next handshake.
    pub async fn next_handshake(&mut self) -> Option<Handshake> {
        timeout(WAIT, self.handshake_rx.recv()).await.ok().flatten()
    }

    /// Assert no handshake arrives for a while.
    pub async fn expect_no_handshake(&mut self) {
        let handshake = timeout(QUIET, self.handshake_rx.recv()).await.ok().flatten();
        assert!(handshake.is_none(), "unexpected handshake: {handshake:?}");
    }
}

/// Callback that forwards every update to the returned receiver.
pub fn collector() -> (
    impl Fn(&ChannelUpdate) -> Result<(), BoxError> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<ChannelUpdate>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |update: &ChannelUpdate| {
        drop(tx.send(update.clone()));
        Ok::<(), BoxError>(())
    };
    (callback, rx)
}

/// Wait for the next update delivered to a [`collector`].
pub async fn next_update(rx: &mut mpsc::UnboundedReceiver<ChannelUpdate>) -> ChannelUpdate {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("collector dropped")
}

/// Assert no update reaches a [`collector`] for a while.
pub async fn expect_no_update(rx: &mut mpsc::UnboundedReceiver<ChannelUpdate>) {
    let update = timeout(QUIET, rx.recv()).await.ok().flatten();
    assert!(update.is_none(), "unexpected update: {update:?}");
}

pub fn expense(id: u64, title: &str) -> Value {
    json!({
        "id": id,
        "organizationId": "org_1",
        "title": title,
        "amount": "42.50",
        "currency": "EUR",
        "status": "PENDING",
        "createdAt": "2026-03-01T12:00:00Z"
    })
}
