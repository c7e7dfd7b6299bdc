//! HTTP API
//!
//! Account and history endpoints for chat clients, plus Prometheus metrics:
//!
//! - `POST /register-or-login`
//! - `GET /users`
//! - `GET /messages/:user_a/:user_b`
//! - `GET /metrics` (optionally behind a bearer token)
//!
//! CORS headers let the browser client call these from its own origin.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{AccountError, RelayError};
use crate::key_vault::KeyVault;
use crate::metrics::RelayMetrics;
use crate::relay::RelayEngine;
use crate::user_directory::{list_profiles, register_or_login, UserDirectory};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<RelayEngine>,
    pub directory: Arc<dyn UserDirectory>,
    pub vault: Arc<KeyVault>,
    pub metrics: RelayMetrics,
    pub metrics_token: Option<String>,
    /// Allowed browser origins; `None` allows any.
    pub cors_origins: Option<Vec<String>>,
}

/// JSON error body with a status code.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!("Request failed: {}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::MissingCredentials => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            AccountError::WrongPassword => Self::new(StatusCode::UNAUTHORIZED, err.to_string()),
            other => Self::internal(other),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            RelayError::UnknownIdentity(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            other => Self::internal(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

/// Middleware to check bearer token for metrics endpoint.
async fn metrics_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/metrics" {
        if let Some(ref expected_token) = state.metrics_token {
            let is_authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .is_some_and(|token| token == expected_token);

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

fn cors_layer(origins: Option<&[String]>) -> CorsLayer {
    let allow_origin = match origins {
        None => AllowOrigin::any(),
        Some(origins) => AllowOrigin::list(origins.iter().filter_map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| warn!("Ignoring invalid CORS origin: {}", origin))
                .ok()
        })),
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Creates the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    let cors = cors_layer(state.cors_origins.as_deref());
    Router::new()
        .route("/register-or-login", post(register_or_login_handler))
        .route("/users", get(users_handler))
        .route("/messages/:user_a/:user_b", get(messages_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_auth_middleware,
        ))
        .layer(cors)
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "safechat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/register-or-login", "/users", "/messages/{user_a}/{user_b}", "/metrics"]
    }))
}

/// Logs a user in, registering them on first use.
async fn register_or_login_handler(
    State(state): State<HttpState>,
    Json(credentials): Json<Credentials>,
) -> Result<Response, ApiError> {
    // Argon2 and RSA key generation are CPU-bound
    let profile = tokio::task::spawn_blocking(move || {
        register_or_login(
            state.directory.as_ref(),
            &state.vault,
            &credentials.username,
            &credentials.password,
        )
    })
    .await
    .map_err(ApiError::internal)??;

    Ok(Json(profile).into_response())
}

async fn users_handler(State(state): State<HttpState>) -> Result<Response, ApiError> {
    let profiles =
        list_profiles(state.directory.as_ref(), &state.vault).map_err(ApiError::internal)?;
    Ok(Json(profiles).into_response())
}

async fn messages_handler(
    State(state): State<HttpState>,
    Path((user_a, user_b)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let parse = |raw: &str| {
        Uuid::parse_str(raw)
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid user id: {}", raw)))
    };
    let (a, b) = (parse(&user_a)?, parse(&user_b)?);

    let history = state.engine.history(a, b).await?;
    Ok(Json(history).into_response())
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}
