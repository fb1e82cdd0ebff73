//! HTTP and WebSocket server for live screening.
//!
//! This module provides a server that:
//! - Accepts live frame streams on `GET /ws/screening` (WebSocket)
//! - Serves a user's records and verdict on `GET /screening-sessions`
//! - Reports liveness on `GET /health` and counters on `GET /stats`
//!
//! # Architecture
//!
//! ```text
//! Browser ──ws──▶ /ws/screening ──▶ session ──▶ analyzer ──▶ aggregator ──▶ store
//!                                                                          │
//! Browser ──GET─▶ /screening-sessions ──▶ decision engine ◀────────────────┘
//! ```

use crate::auth::{bearer_token, AuthError, Authenticator};
use crate::core::{decide, FrameAnalyzer, ScreeningRecord, ScreeningVerdict};
use crate::session::{run_session, FrameTransport, SessionContext, TransportError};
use crate::stats::{create_shared_stats, SharedPipelineStats, StatsSnapshot};
use crate::store::{RecordStore, SqliteStore};
use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to
    pub host: String,
    /// Port to bind to (0 for random)
    pub port: u16,
    /// SQLite database holding records and tokens
    pub database_path: PathBuf,
    /// Frame analyzer used by every session
    pub analyzer: FrameAnalyzer,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(host: impl Into<String>, port: u16, database_path: PathBuf) -> Self {
        Self {
            host: host.into(),
            port,
            database_path,
            analyzer: FrameAnalyzer::default(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: FrameAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }
}

/// Shared server state
pub struct ServerState {
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn RecordStore>,
    analyzer: Arc<FrameAnalyzer>,
    stats: SharedPipelineStats,
}

impl ServerState {
    /// Create new server state from its collaborators
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn RecordStore>,
        analyzer: FrameAnalyzer,
    ) -> Self {
        Self {
            authenticator,
            store,
            analyzer: Arc::new(analyzer),
            stats: create_shared_stats(),
        }
    }

    /// State backed by one SQLite file for both records and tokens
    pub fn with_sqlite(store: Arc<SqliteStore>, analyzer: FrameAnalyzer) -> Self {
        Self::new(store.clone(), store, analyzer)
    }

    pub fn stats(&self) -> SharedPipelineStats {
        Arc::clone(&self.stats)
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            authenticator: Arc::clone(&self.authenticator),
            store: Arc::clone(&self.store),
            analyzer: Arc::clone(&self.analyzer),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// WebSocket adapter for the session transport.
struct WsTransport {
    socket: WebSocket,
}

impl FrameTransport for WsTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(_)) => {
                    return Some(Err(TransportError(
                        "binary messages are not accepted".to_string(),
                    )))
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError(e.to_string()))),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn close(&mut self) {
        // The peer may already be gone
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /stats
async fn stats(State(state): State<Arc<ServerState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// GET /ws/screening
async fn screening_ws(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    let ctx = state.session_context();
    ws.on_upgrade(move |socket| async move {
        let report = run_session(WsTransport { socket }, ctx).await;
        tracing::debug!(end = ?report.end, "WebSocket session finished");
    })
}

/// GET /screening-sessions
///
/// Returns the caller's records, newest first, with the current verdict.
async fn screening_sessions(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<ScreeningVerdict>, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                AuthError::Missing.to_string(),
            )
        })?;

    // Both lookups hit the database, so keep them off the async workers
    let token = token.to_string();
    let authenticator = Arc::clone(&state.authenticator);
    let store = Arc::clone(&state.store);
    let lookup = tokio::task::spawn_blocking(move || -> Result<Vec<ScreeningRecord>, ApiError> {
        let user_id = authenticator.validate(&token).map_err(|e| match e {
            AuthError::Backend(_) => {
                tracing::error!("Identity lookup failed: {}", e);
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "AUTH_BACKEND", e.to_string())
            }
            other => api_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", other.to_string()),
        })?;

        store.list_by_user(&user_id).map_err(|e| {
            tracing::error!("Failed to read screening records: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string())
        })
    })
    .await
    .map_err(|e| {
        tracing::error!("Record lookup task failed: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
    })?;

    Ok(Json(decide(lookup?)))
}

/// Build the router over the given state
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/ws/screening", get(screening_ws))
        .route("/screening-sessions", get(screening_sessions))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the server with a SQLite store at `config.database_path`
pub async fn run(
    config: ServerConfig,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let store = SqliteStore::open(&config.database_path).with_context(|| {
        format!(
            "failed to open record store at {}",
            config.database_path.display()
        )
    })?;
    let state = ServerState::with_sqlite(Arc::new(store), config.analyzer);
    run_with_state(&config.host, config.port, Arc::new(state)).await
}

/// Run the server over pre-built state, which already owns its store and
/// analyzer
pub async fn run_with_state(
    host: &str,
    port: u16,
    state: Arc<ServerState>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(state);

    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Screening server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
