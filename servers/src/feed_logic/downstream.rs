use crate::feed_logic::config::FeedConfig;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use lib_realtime::models::message::{TOPIC_HEARTBEAT, TOPIC_PING, TOPIC_PONG};
use lib_realtime::Envelope;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone)]
pub struct FeedState {
    pub frames: broadcast::Sender<String>,
    connected: Arc<AtomicUsize>,
}

impl FeedState {
    pub fn new(frames: broadcast::Sender<String>) -> Self {
        Self {
            frames,
            connected: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub async fn run(
    config: FeedConfig,
    state: FeedState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    log::info!("Feed server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Feed server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<FeedState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<FeedState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "clients": state.connected.load(Ordering::Relaxed),
    }))
}

async fn handle_socket(socket: WebSocket, state: FeedState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    state.connected.fetch_add(1, Ordering::Relaxed);
    log::info!("Client {} connected", client_id);

    let mut frames_rx = state.frames.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(envelope) = serde_json::from_str::<Envelope>(text.as_str()) else {
                            log::warn!("Client {} sent an unparseable frame", client_id);
                            continue;
                        };
                        if envelope.topic == TOPIC_PING || envelope.topic == TOPIC_HEARTBEAT {
                            log::debug!("Ping from client {}: {}", client_id, envelope.data);
                            let pong = Envelope::new(TOPIC_PONG, json!({ "client_id": envelope.data.get("client_id") }));
                            if let Ok(text) = serde_json::to_string(&pong) {
                                if sender.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                        } else {
                            log::info!("Client {} sent '{}'", client_id, envelope.topic);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Client {} read error: {}", client_id, e);
                        break;
                    }
                }
            }
            frame = frames_rx.recv() => {
                match frame {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Client {} lagging, {} frames skipped", client_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    state.connected.fetch_sub(1, Ordering::Relaxed);
    log::info!("Client {} disconnected", client_id);
}
