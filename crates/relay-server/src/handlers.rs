//! Connection handlers for the relay server.
//!
//! This module wires sockets to the relay: each upgraded WebSocket becomes
//! a session that is registered on connect and removed when the client
//! goes away.

use crate::config::{Backend, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use relay_core::{ListenerState, MemoryStore, PubSub, RedisStore, Relay, Store};
use relay_transport::{CloseReason, WebSocketSession};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay.
    pub relay: Arc<Relay>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the store is unreachable or the server fails to
/// start.
pub async fn run_server(config: Config) -> Result<()> {
    let (store, pubsub) = open_store(&config).await?;
    let relay = Arc::new(Relay::new(store, pubsub, config.relay_config()));
    let state = Arc::new(AppState {
        relay: Arc::clone(&relay),
        config: config.clone(),
    });

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Err(e) = relay.shutdown().await {
        warn!(error = %e, "Relay shutdown incomplete");
    }
    info!("Relay server stopped");

    Ok(())
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Open the configured store, once for reads and once for pub/sub.
async fn open_store(config: &Config) -> Result<(Arc<dyn Store>, Arc<dyn PubSub>)> {
    match config.store.backend {
        Backend::Redis => {
            let settings = config.redis_settings();
            let store = Arc::new(RedisStore::connect(&settings).await.with_context(|| {
                format!("Failed to connect to Redis at {}:{}", settings.host, settings.port)
            })?);
            let reads: Arc<dyn Store> = store.clone();
            let pubsub: Arc<dyn PubSub> = store;
            Ok((reads, pubsub))
        }
        Backend::Memory => {
            warn!("Using in-process store; only local publishers are visible");
            let store = Arc::new(MemoryStore::new());
            let reads: Arc<dyn Store> = store.clone();
            let pubsub: Arc<dyn PubSub> = store;
            Ok((reads, pubsub))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let listener = state.relay.listener_state().await;
    let status = if listener == ListenerState::Failed {
        "degraded"
    } else {
        "ok"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.relay.session_count(),
        "listener": listener.to_string(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut session = WebSocketSession::new(socket, Some(addr), &state.config.websocket_config());
    let id = session.id().clone();
    debug!(session = %id, remote = %addr, "WebSocket connected");

    if let Err(e) = state.relay.connect(session.outbound()).await {
        error!(session = %id, error = %e, "Failed to register session");
        session.shutdown().await;
        return;
    }

    let reason = session.wait_closed().await;
    if matches!(reason, CloseReason::Error(_)) {
        metrics::record_socket_error();
    }

    if let Err(e) = state.relay.disconnect(&id).await {
        warn!(session = %id, error = %e, "Disconnect left subscriptions behind");
    }
    session.shutdown().await;

    debug!(session = %id, reason = ?reason, "WebSocket disconnected");
}
