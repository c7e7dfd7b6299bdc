// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Drives one client connection through its lifecycle:
//!
//! - **Connecting**: the upgrade request names the user in its path
//!   (`/ws/{user_id}`).
//! - **Authenticated**: the identity resolved in the user directory. Anything
//!   else is closed with code 1008 (policy violation).
//! - **Active**: the user is registered in the connection registry. Inbound
//!   chat frames go through the relay engine; frames other connections address
//!   to this user arrive through the registry channel.
//! - **Closed**: client close, end of stream, idle timeout, transport error,
//!   or a newer connection of the same user. The registry entry is released.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection_registry::{Registration, RegistryMessage};
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::protocol::{encode_frame, OutboundFrame};
use crate::rate_limit::RateLimiter;
use crate::relay::RelayEngine;

/// How long a rejected client gets to acknowledge the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Shared dependencies for each connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub engine: Arc<RelayEngine>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: RelayMetrics,
    pub max_message_size: usize,
    pub idle_timeout: Duration,
}

/// Extracts the user identity from a `/ws/{user_id}` request path.
pub fn identity_from_path(path: &str) -> Option<Uuid> {
    let raw = path.strip_prefix("/ws/")?;
    let raw = raw.split('?').next().unwrap_or(raw).trim_end_matches('/');
    Uuid::parse_str(raw).ok()
}

fn authenticate(engine: &RelayEngine, path: &str) -> Result<Uuid, &'static str> {
    let user_id = identity_from_path(path).ok_or("malformed identity")?;
    match engine.resolve_identity(&user_id) {
        Ok(Some(_)) => Ok(user_id),
        Ok(None) => Err("unknown identity"),
        Err(e) => {
            warn!("Identity lookup failed: {}", e);
            Err("identity lookup failed")
        }
    }
}

async fn send_error<W>(write: &mut W, err: &RelayError) -> Result<(), RelayError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let text = encode_frame(&OutboundFrame::error(err))
        .map_err(|e| RelayError::TransportFailure(e.to_string()))?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| RelayError::TransportFailure(e.to_string()))
}

/// Completes the WebSocket upgrade on `stream` and runs the connection.
pub async fn serve_socket(stream: TcpStream, deps: ConnectionDeps) {
    let mut path = String::from("/");
    let upgrade = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        },
    );

    // Bounded so clients cannot hold a slot without finishing the upgrade
    let upgraded = timeout(deps.idle_timeout, upgrade).await;
    match upgraded {
        Ok(Ok(ws_stream)) => {
            let metrics = deps.metrics.clone();
            metrics.connections_total.inc();
            metrics.connections_active.inc();
            handle_connection(ws_stream, &path, deps).await;
            metrics.connections_active.dec();
        }
        Ok(Err(e)) => {
            warn!("WebSocket handshake failed: {}", e);
            deps.metrics.connection_errors.inc();
        }
        Err(_) => {
            warn!("WebSocket handshake timeout");
            deps.metrics.connection_errors.inc();
        }
    }
}

/// Handles an upgraded WebSocket connection requested at `path`.
pub async fn handle_connection<S>(mut ws_stream: WebSocketStream<S>, path: &str, deps: ConnectionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ConnectionDeps {
        engine,
        rate_limiter,
        metrics,
        max_message_size,
        idle_timeout,
    } = deps;
    // Logs carry a random label, never the user identity.
    let session = &Uuid::new_v4().to_string()[..8];

    let user_id = match authenticate(&engine, path) {
        Ok(user_id) => user_id,
        Err(reason) => {
            metrics.handshakes_rejected.inc();
            warn!("[{}] Handshake rejected: {}", session, reason);
            let close = CloseFrame {
                code: CloseCode::Policy,
                reason: reason.into(),
            };
            if ws_stream.close(Some(close)).await.is_ok() {
                // Wait briefly for the client's close reply
                let _ = timeout(CLOSE_GRACE, ws_stream.next()).await;
            }
            return;
        }
    };

    let registry = engine.registry().clone();
    let Registration {
        connection_id,
        receiver: mut registry_rx,
    } = registry.register(user_id);
    info!("[{}] Connection active", session);

    let (mut write, mut read) = ws_stream.split();

    loop {
        let msg = tokio::select! {
            ws_msg = timeout(idle_timeout, read.next()) => {
                match ws_msg {
                    Ok(Some(Ok(msg))) => msg,
                    Ok(Some(Err(e))) => {
                        debug!("[{}] Transport error: {}", session, e);
                        metrics.connection_errors.inc();
                        break;
                    }
                    Ok(None) => {
                        debug!("[{}] Disconnected", session);
                        break;
                    }
                    Err(_) => {
                        warn!("[{}] Idle timeout", session);
                        break;
                    }
                }
            }
            registry_msg = registry_rx.recv() => {
                match registry_msg {
                    Some(RegistryMessage { data }) => {
                        if write.send(Message::Text(data)).await.is_err() {
                            debug!("[{}] Failed to forward frame", session);
                            break;
                        }
                        continue;
                    }
                    None => {
                        debug!("[{}] Superseded by a newer connection", session);
                        break;
                    }
                }
            }
        };

        let result = match msg {
            Message::Text(text) => {
                if text.len() > max_message_size {
                    Err(RelayError::Validation(format!(
                        "message exceeds {} bytes",
                        max_message_size
                    )))
                } else if !rate_limiter.consume(&user_id) {
                    metrics.rate_limited.inc();
                    warn!("[{}] Rate limited", session);
                    Err(RelayError::Validation("rate limit exceeded".to_string()))
                } else {
                    metrics.messages_received.inc();
                    engine.handle_frame(user_id, &text).await.map(|_| ())
                }
            }
            Message::Binary(_) => Err(RelayError::Validation(
                "binary frames are not supported".to_string(),
            )),
            Message::Ping(data) => {
                let _ = write.send(Message::Pong(data)).await;
                Ok(())
            }
            Message::Close(_) => {
                debug!("[{}] Client closed connection", session);
                break;
            }
            _ => Ok(()),
        };

        if let Err(err) = result {
            metrics.messages_rejected.inc();
            debug!("[{}] Message rejected ({})", session, err.kind());
            if let Err(e) = send_error(&mut write, &err).await {
                debug!("[{}] {}", session, e);
                break;
            }
        }
    }

    registry.release(&user_id, connection_id);
    info!("[{}] Connection closed", session);
}
