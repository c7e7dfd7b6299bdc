// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Plain HTTP on the WebSocket port
//!
//! Load balancers health-check the WebSocket listener with `GET /health`, `/up` or
//! `/ready`. The accept loop peeks at the request line and answers those
//! directly; everything else goes on to the WebSocket handshake.
//!
//! Routing looks only at the request line. Browsers may place the
//! `Upgrade: websocket` header anywhere in the request, possibly beyond the
//! peeked bytes or in a later TCP segment.

use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection_registry::ConnectionRegistry;

/// Bytes peeked from a new connection.
const PEEK_LEN: usize = 512;

const HEALTH_PATHS: [&str; 3] = ["/health", "/up", "/ready"];

/// Where a freshly accepted connection should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekRoute {
    /// Hand the stream to the WebSocket handshake.
    WebSocket,
    /// Answer with the health document.
    Health,
    /// Answer 404 and close.
    NotFound,
}

/// Classifies a connection from the first bytes it sent.
pub fn classify(head: &[u8]) -> PeekRoute {
    let head = String::from_utf8_lossy(head);
    let Some((request_line, rest)) = head.split_once("\r\n") else {
        // Incomplete request line: let the handshake read the rest.
        return PeekRoute::WebSocket;
    };

    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return PeekRoute::WebSocket;
    };
    if !method.eq_ignore_ascii_case("GET") {
        return PeekRoute::WebSocket;
    }

    let path = target.split('?').next().unwrap_or(target);
    if HEALTH_PATHS.contains(&path) {
        return PeekRoute::Health;
    }
    if path == "/ws" || path.starts_with("/ws/") {
        return PeekRoute::WebSocket;
    }
    if rest.to_ascii_lowercase().contains("upgrade: websocket") {
        return PeekRoute::WebSocket;
    }
    PeekRoute::NotFound
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Answers plain HTTP requests on the WebSocket port. Returns the stream back
/// if it should go through the WebSocket handshake instead.
pub async fn route_plain_http(
    stream: TcpStream,
    start_time: Instant,
    registry: &ConnectionRegistry,
) -> Option<TcpStream> {
    let mut peek_buf = [0u8; PEEK_LEN];
    let n = match stream.peek(&mut peek_buf).await {
        Ok(n) if n > 0 => n,
        _ => return Some(stream),
    };

    let response = match classify(&peek_buf[..n]) {
        PeekRoute::WebSocket => return Some(stream),
        PeekRoute::Health => {
            let body = serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": start_time.elapsed().as_secs(),
                "connected_users": registry.connected_count(),
            });
            http_response("200 OK", &body.to_string())
        }
        PeekRoute::NotFound => http_response(
            "404 Not Found",
            r#"{"error":"This is a WebSocket endpoint, connect to /ws/{user_id}"}"#,
        ),
    };

    let mut stream = stream;
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
    debug!("Handled plain HTTP request");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_paths() {
        assert_eq!(classify(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n"), PeekRoute::Health);
        assert_eq!(classify(b"GET /up HTTP/1.1\r\n\r\n"), PeekRoute::Health);
        assert_eq!(classify(b"GET /ready?source=lb HTTP/1.1\r\n\r\n"), PeekRoute::Health);
    }

    #[test]
    fn test_ws_path_routes_to_websocket_without_upgrade_header() {
        // Headers truncated before Upgrade appears
        let head = b"GET /ws/11111111-1111-1111-1111-111111111111 HTTP/1.1\r\nHost: relay\r\nUser-Agent: Mozilla/5.0";
        assert_eq!(classify(head), PeekRoute::WebSocket);
    }

    #[test]
    fn test_upgrade_header_on_other_path() {
        let head = b"GET /chat HTTP/1.1\r\nHost: relay\r\nUpgrade: websocket\r\n\r\n";
        assert_eq!(classify(head), PeekRoute::WebSocket);
    }

    #[test]
    fn test_unknown_plain_get_is_not_found() {
        assert_eq!(classify(b"GET /healthz HTTP/1.1\r\n\r\n"), PeekRoute::NotFound);
        assert_eq!(classify(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), PeekRoute::NotFound);
    }

    #[test]
    fn test_incomplete_or_non_get_goes_to_handshake() {
        assert_eq!(classify(b"GET /hea"), PeekRoute::WebSocket);
        assert_eq!(classify(b"POST /health HTTP/1.1\r\n\r\n"), PeekRoute::WebSocket);
        assert_eq!(classify(b"\x16\x03\x01\x02\x00"), PeekRoute::WebSocket);
    }
}
