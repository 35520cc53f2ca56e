//! # In-process WebSocket Test Server
//!
//! A small tokio-tungstenite server for integration tests. It accepts any
//! number of clients on `127.0.0.1:<random port>`, records every text frame
//! they send, and lets a test push frames, close connections with a chosen
//! close code, or drop them without a close handshake.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

#[derive(Debug, Clone)]
enum Control {
    Push(String),
    Ping,
    Close(u16),
    Abort,
}

pub struct TestServer {
    addr: SocketAddr,
    control: broadcast::Sender<Control>,
    received: Arc<Mutex<Vec<String>>>,
    pongs: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("test listener address");
        let (control, _) = broadcast::channel(256);
        let received = Arc::new(Mutex::new(Vec::new()));
        let pongs = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn({
            let control = control.clone();
            let received = Arc::clone(&received);
            let pongs = Arc::clone(&pongs);
            let accepted = Arc::clone(&accepted);
            let open = Arc::clone(&open);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    // Subscribe before the handshake so no control message is missed.
                    let commands = control.subscribe();
                    tokio::spawn(serve_client(
                        stream,
                        commands,
                        Arc::clone(&received),
                        Arc::clone(&pongs),
                        Arc::clone(&accepted),
                        Arc::clone(&open),
                    ));
                }
            }
        });

        Self {
            addr,
            control,
            received,
            pongs,
            accepted,
            open,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Sends a text frame to every open client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.control.send(Control::Push(text.into()));
    }

    /// Sends a WebSocket ping to every open client.
    pub fn ping_all(&self) {
        let _ = self.control.send(Control::Ping);
    }

    /// Closes every open client with `code`.
    pub fn close_all(&self, code: u16) {
        let _ = self.control.send(Control::Close(code));
    }

    /// Drops every open client without a close frame.
    pub fn abort_all(&self) {
        let _ = self.control.send(Control::Abort);
    }

    /// Stops listening and drops every open client.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.abort_all();
    }

    /// Text frames received from clients, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Received frames parsed as JSON objects whose `type` is `topic`.
    pub fn received_of_type(&self, topic: &str) -> Vec<serde_json::Value> {
        self.received()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter(|v| v["type"] == topic)
            .collect()
    }

    /// WebSocket pongs received from clients.
    pub fn pongs(&self) -> usize {
        self.pongs.load(Ordering::SeqCst)
    }

    /// Completed handshakes since start.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Clients currently connected.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_client(
    stream: TcpStream,
    mut commands: broadcast::Receiver<Control>,
    received: Arc<Mutex<Vec<String>>>,
    pongs: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Test server handshake failed: {}", e);
            return;
        }
    };
    accepted.fetch_add(1, Ordering::SeqCst);
    open.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(Control::Push(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Ping) => {
                    if write.send(Message::Ping(b"keepalive".to_vec().into())).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "test server close".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    // Drain until the client answers the close handshake.
                    let _ = tokio::time::timeout(Duration::from_secs(1), async {
                        while let Some(Ok(_)) = read.next().await {}
                    })
                    .await;
                    break;
                }
                Ok(Control::Abort) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(mut frames) = received.lock() {
                        frames.push(text.as_str().to_string());
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    pongs.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    open.fetch_sub(1, Ordering::SeqCst);
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Awaits `future`, failing the test if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
