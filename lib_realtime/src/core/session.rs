//! # Connection Session
//!
//! The task that owns the socket for one `connect()` ... `disconnect()` span.
//!
//! A session opens the transport, pumps frames until the socket goes away,
//! then walks the backoff schedule until it is open again. It ends when:
//! - its cancellation token fires (`disconnect()` to zero, `force_disconnect()`)
//! - the server closes cleanly with code 1000
//! - the retry budget runs out
//! - the very first attempt fails while a `connect()` caller is waiting on it

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::core::backoff::Backoff;
use crate::core::connection_manager::Shared;
use crate::error::{ProtocolError, RealtimeError, Result};
use crate::models::ConnectionStatus;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Requests from the public handle to the session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Send(String),
    Reconnect,
}

pub(crate) struct SessionParams {
    pub(crate) generation: u64,
    pub(crate) url: String,
    pub(crate) commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub(crate) cancel: CancellationToken,
    /// Present while a `connect()` caller waits for the first open.
    pub(crate) ready: Option<oneshot::Sender<Result<()>>>,
}

/// Why the read loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum DriveOutcome {
    Cancelled,
    CleanClose,
    Lost,
    ReconnectRequested,
}

pub(crate) async fn run(shared: Arc<Shared>, mut params: SessionParams) {
    let generation = params.generation;
    let mut backoff = Backoff::new(shared.config.backoff_policy());

    let first = tokio::select! {
        _ = params.cancel.cancelled() => {
            log::debug!("Session {} cancelled before the socket opened", generation);
            return;
        }
        result = establish(&params.url, shared.config.connection_timeout()) => result,
    };

    let mut socket = match first {
        Ok(ws) => {
            log::info!("Connected to {} (session {})", params.url, generation);
            shared.mark_open(generation);
            if let Some(ready) = params.ready.take() {
                let _ = ready.send(Ok(()));
            }
            Some(ws)
        }
        Err(e) => match params.ready.take() {
            Some(ready) => {
                log::error!("Connection to {} failed: {}", params.url, e);
                shared.fail_first_attempt(generation);
                if ready.send(Err(e)).is_err() {
                    log::debug!("connect() caller for session {} went away", generation);
                }
                return;
            }
            None => {
                log::warn!("Connection to {} failed: {}", params.url, e);
                shared.transition(generation, ConnectionStatus::Error);
                None
            }
        },
    };

    loop {
        let outcome = match socket.take() {
            Some(ws) => drive(&shared, &mut params, ws).await,
            None => DriveOutcome::Lost,
        };

        let immediate = match outcome {
            DriveOutcome::Cancelled => return,
            DriveOutcome::CleanClose => {
                log::info!("Server closed {} normally", params.url);
                shared.finish_session(generation, ConnectionStatus::Disconnected);
                return;
            }
            DriveOutcome::ReconnectRequested => {
                backoff.reset();
                true
            }
            DriveOutcome::Lost => false,
        };

        match reopen(&shared, &mut params, &mut backoff, immediate).await {
            Some(ws) => socket = Some(ws),
            None => return,
        }
    }
}

/// Opens the transport, bounded by `timeout`.
async fn establish(url: &str, timeout: Duration) -> Result<WsStream> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(source)) => Err(RealtimeError::ConnectionEstablishment {
            url: url.to_string(),
            source,
        }),
        Err(_) => Err(RealtimeError::ConnectionTimeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Pumps one open socket until it closes, fails or is cancelled.
async fn drive(shared: &Shared, params: &mut SessionParams, ws: WsStream) -> DriveOutcome {
    let generation = params.generation;
    let close_timeout = shared.config.close_timeout();
    let period = shared.config.heartbeat_interval();
    let heartbeat_enabled = shared.config.enable_heartbeat && !period.is_zero();
    let period = period.max(Duration::from_millis(1));

    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            biased;

            _ = params.cancel.cancelled() => {
                close_gracefully(&mut write, close_timeout).await;
                return DriveOutcome::Cancelled;
            }

            command = params.commands.recv() => match command {
                Some(SessionCommand::Send(text)) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        log::warn!("Send on {} failed: {}", params.url, e);
                        shared.transition(generation, ConnectionStatus::Error);
                        return DriveOutcome::Lost;
                    }
                    shared.record_sent();
                }
                Some(SessionCommand::Reconnect) => {
                    close_gracefully(&mut write, close_timeout).await;
                    return DriveOutcome::ReconnectRequested;
                }
                None => {
                    close_gracefully(&mut write, close_timeout).await;
                    return DriveOutcome::Cancelled;
                }
            },

            _ = heartbeat.tick(), if heartbeat_enabled => {
                let Some(text) = shared.heartbeat_frame() else { continue };
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    log::warn!("Heartbeat on {} failed: {}", params.url, e);
                    shared.transition(generation, ConnectionStatus::Error);
                    return DriveOutcome::Lost;
                }
                log::trace!("Heartbeat sent on {}", params.url);
            }

            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = shared.handle_text(text.as_str());
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    shared.record_protocol_error(&ProtocolError::BinaryFrame(bytes.len()));
                }
                // tungstenite queues the pong for inbound pings itself.
                Some(Ok(WsMessage::Ping(_)))
                | Some(Ok(WsMessage::Pong(_)))
                | Some(Ok(WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    let clean = frame.as_ref().is_some_and(|f| f.code == CloseCode::Normal);
                    log::info!(
                        "Close frame from {}: {:?}",
                        params.url,
                        frame.as_ref().map(|f| (u16::from(f.code), f.reason.as_str()))
                    );
                    let _ = tokio::time::timeout(close_timeout, write.close()).await;
                    return if clean { DriveOutcome::CleanClose } else { DriveOutcome::Lost };
                }
                Some(Err(e)) => {
                    log::warn!("Read error on {}: {}", params.url, e);
                    shared.transition(generation, ConnectionStatus::Error);
                    return DriveOutcome::Lost;
                }
                None => {
                    log::warn!("Stream from {} ended without a close frame", params.url);
                    return DriveOutcome::Lost;
                }
            },
        }
    }
}

/// Sends a normal close frame, giving up after `timeout`.
async fn close_gracefully(write: &mut WsSink, timeout: Duration) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client disconnect".into(),
    };
    match tokio::time::timeout(timeout, write.send(WsMessage::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Close handshake failed: {}", e),
        Err(_) => log::debug!("Close handshake timed out after {:?}", timeout),
    }
}

/// Walks the backoff schedule until the socket reopens.
///
/// Returns `None` when cancelled or when the retry budget is exhausted.
async fn reopen(
    shared: &Shared,
    params: &mut SessionParams,
    backoff: &mut Backoff,
    mut immediate: bool,
) -> Option<WsStream> {
    let generation = params.generation;

    loop {
        if immediate {
            shared.transition(generation, ConnectionStatus::Reconnecting);
        } else {
            let Some(delay) = backoff.schedule() else {
                log::error!(
                    "Giving up on {} after {} reconnect attempts",
                    params.url,
                    backoff.attempt()
                );
                shared.finish_session(generation, ConnectionStatus::Error);
                return None;
            };
            shared.record_backoff(generation, backoff);
            shared.transition(generation, ConnectionStatus::Reconnecting);
            log::info!(
                "Reconnecting to {} in {}ms (attempt {})",
                params.url,
                delay.as_millis(),
                backoff.attempt()
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = params.cancel.cancelled() => return None,
                    command = params.commands.recv() => match command {
                        Some(SessionCommand::Reconnect) => {
                            backoff.reset();
                            break;
                        }
                        Some(SessionCommand::Send(_)) => {
                            log::debug!("Dropping outbound frame while reconnecting");
                        }
                        None => return None,
                    },
                    _ = &mut sleep => break,
                }
            }
        }
        immediate = false;

        let result = tokio::select! {
            _ = params.cancel.cancelled() => return None,
            result = establish(&params.url, shared.config.connection_timeout()) => result,
        };
        match result {
            Ok(ws) => {
                log::info!("Reconnected to {} (session {})", params.url, generation);
                backoff.reset();
                shared.mark_open(generation);
                return Some(ws);
            }
            Err(e) => {
                log::warn!("Reconnect to {} failed: {}", params.url, e);
                shared.transition(generation, ConnectionStatus::Error);
            }
        }
    }
}
