// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SafeChat Relay Server
//!
//! Real-time relay for chat messages between registered users.
//! Provides:
//! - WebSocket endpoint (`/ws/{user_id}`) for live message relay
//! - HTTP API for register-or-login, the user list and conversation history
//! - Prometheus metrics, rate limiting and connection limiting

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use safechat_relay::config::RelayConfig;
use safechat_relay::connection_limit::ConnectionLimiter;
use safechat_relay::connection_registry::ConnectionRegistry;
use safechat_relay::handler::{self, ConnectionDeps};
use safechat_relay::http::{create_router, HttpState};
use safechat_relay::key_vault::{create_key_store, KeyVault};
use safechat_relay::message_store::{create_message_store, MessageStore};
use safechat_relay::metrics::RelayMetrics;
use safechat_relay::plain_http::route_plain_http;
use safechat_relay::rate_limit::RateLimiter;
use safechat_relay::relay::RelayEngine;
use safechat_relay::user_directory::{create_user_directory, UserDirectory};

/// Rate limiter buckets idle this long are dropped.
const RATE_LIMIT_IDLE: Duration = Duration::from_secs(1800);
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("safechat_relay=info".parse().expect("valid directive")),
        )
        .init();

    let config = RelayConfig::from_env();

    // Refuse to serve chat traffic in the clear beyond localhost
    if !config.is_loopback() && !config.tls_verified {
        error!("=======================================================================");
        error!("SECURITY ERROR: the relay MUST run behind a TLS proxy in production!");
        error!("=======================================================================");
        error!(
            "The WebSocket listener is configured for a non-localhost address ({})",
            config.listen_addr
        );
        error!("but TLS termination has not been confirmed.");
        error!("");
        error!("Either run behind a TLS-terminating proxy and set SAFECHAT_TLS_VERIFIED=1,");
        error!("or bind to localhost for development: SAFECHAT_LISTEN_ADDR=127.0.0.1:8000");
        error!("=======================================================================");
        std::process::exit(1);
    }

    info!("Starting SafeChat Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("HTTP API: {}", config.http_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Idle timeout: {}s", config.idle_timeout_secs);

    let store: Arc<dyn MessageStore> =
        match create_message_store(config.storage_backend, &config.data_dir) {
            Ok(store) => Arc::from(store),
            Err(e) => {
                error!("Failed to open message store: {}", e);
                std::process::exit(1);
            }
        };
    let directory: Arc<dyn UserDirectory> =
        match create_user_directory(config.storage_backend, &config.data_dir) {
            Ok(directory) => Arc::from(directory),
            Err(e) => {
                error!("Failed to open user directory: {}", e);
                std::process::exit(1);
            }
        };
    let vault = match create_key_store(config.storage_backend, &config.data_dir) {
        Ok(keys) => Arc::new(KeyVault::new(Arc::from(keys), config.key_bits)),
        Err(e) => {
            error!("Failed to open key store: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = RelayMetrics::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let engine = Arc::new(RelayEngine::new(
        vault.clone(),
        store,
        directory.clone(),
        registry.clone(),
        metrics.clone(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_min));
    let connection_limiter = ConnectionLimiter::new(config.max_connections);
    let start_time = Instant::now();

    match &config.cors_origins {
        Some(origins) => info!("CORS origins: {}", origins.join(", ")),
        None => info!("CORS: any origin"),
    }

    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !config.http_addr.ip().is_loopback() {
        warn!("Metrics exposed on non-localhost without auth token");
    }

    let http_router = create_router(HttpState {
        engine: engine.clone(),
        directory,
        vault,
        metrics: metrics.clone(),
        metrics_token: config.metrics_token.clone(),
        cors_origins: config.cors_origins.clone(),
    });
    let http_listener = match TcpListener::bind(config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind HTTP listener on {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    let cleanup_rate_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(RATE_LIMIT_CLEANUP_INTERVAL).await;
            let removed = cleanup_rate_limiter.cleanup_inactive(RATE_LIMIT_IDLE);
            if removed > 0 {
                info!("Cleaned up {} stale rate limiter entries", removed);
            }
        }
    });

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind WebSocket listener on {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    info!("WebSocket server listening on {}", config.listen_addr);

    let deps = ConnectionDeps {
        engine,
        rate_limiter,
        metrics: metrics.clone(),
        max_message_size: config.max_message_size,
        idle_timeout: config.idle_timeout(),
    };

    while let Ok((stream, _addr)) = listener.accept().await {
        let Some(connection_guard) = connection_limiter.try_acquire() else {
            warn!(
                "Connection rejected: at max capacity ({}/{})",
                connection_limiter.active_count(),
                connection_limiter.max_connections()
            );
            metrics.connection_errors.inc();
            drop(stream);
            continue;
        };

        let deps = deps.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let _guard = connection_guard;
            if let Some(stream) = route_plain_http(stream, start_time, &registry).await {
                handler::serve_socket(stream, deps).await;
            }
        });
    }
}
