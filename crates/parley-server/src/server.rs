use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use parley_store::{ConversationLog, Database};

use crate::registry::{start_lock_sweep, SessionRegistry};
use crate::socket::ws_handler;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Per-participant outbound queue depth before events are dropped.
    pub max_send_queue: usize,
    pub lock_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7171,
            max_send_queue: 256,
            lock_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<ServerConfig>,
    started_at: tokio::time::Instant,
}

/// Running server. Dropping the handle aborts the accept loop and the
/// lock sweep.
pub struct ServerHandle {
    pub port: u16,
    server: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.server.abort();
        self.sweep.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.registry.active_sessions(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// Bind and start serving. Port 0 binds an ephemeral port; the bound port
/// is reported on the returned handle.
pub async fn start(config: ServerConfig, db: Database) -> std::io::Result<ServerHandle> {
    let registry = Arc::new(SessionRegistry::new(Arc::new(ConversationLog::new(db))));
    let sweep = start_lock_sweep(
        Arc::clone(&registry),
        config.sweep_interval,
        config.lock_timeout,
    );

    let state = AppState {
        registry,
        config: Arc::new(config.clone()),
        started_at: tokio::time::Instant::now(),
    };
    let app = build_router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let port = listener.local_addr()?.port();
    tracing::info!(port, "listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server exited");
        }
    });

    Ok(ServerHandle { port, server, sweep })
}
