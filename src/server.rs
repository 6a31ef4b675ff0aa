//!
//! docbridge HTTP server
//! ---------------------
//! This module defines the Axum-based HTTP surfaces and owns the process lifecycle.
//!
//! Responsibilities:
//! - Acquire the Graph session at startup and tear it down on every exit path.
//! - Simple-call routes (`/list_files`, `/get_file_content`, `/get_site_info`, also
//!   under `/mcp/...`) relayed through the bridge; failures answer 500 `{"detail": ...}`.
//! - Structured-RPC endpoint `POST /mcp` (JSON-RPC 2.0, MCP tool methods).
//! - Liveness (`GET /`) and session status (`GET /status`).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::FutureExt; // for catch_unwind on async blocks
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{DeliveryMode, Settings};
use crate::error::BridgeError;
use crate::repository::{DocumentRepository, GraphRepository};
use crate::rpc::envelope::parse_request;
use crate::rpc::{Bridge, Delivery, DirectDelivery, Dispatcher, LoopbackDelivery, OperationRegistry};
use crate::session::{ClientCredentialSource, CredentialSource, SessionLifecycle};

/// Shared server state injected into all handlers.
///
/// Everything here is read-only after startup; the live session is reached
/// through `sessions`, which swaps whole contexts on refresh.
#[derive(Clone)]
pub struct AppState {
    pub app_name: String,
    pub sessions: Arc<SessionLifecycle>,
    pub dispatcher: Arc<Dispatcher>,
    pub bridge: Arc<Bridge>,
}

/// Address the loopback adapter should dial for a listener bound to `addr`.
fn loopback_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    };
    SocketAddr::new(ip, addr.port())
}

/// Wire dispatcher and bridge around an already started session lifecycle.
pub fn assemble(
    settings: &Settings,
    local_addr: SocketAddr,
    sessions: Arc<SessionLifecycle>,
    repository: Arc<dyn DocumentRepository>,
) -> anyhow::Result<AppState> {
    let dispatcher = Arc::new(Dispatcher::new(OperationRegistry::standard(), sessions.clone(), repository, &settings.app_name));
    let delivery: Arc<dyn Delivery> = match settings.delivery {
        DeliveryMode::Direct => Arc::new(DirectDelivery::new(dispatcher.clone())),
        DeliveryMode::Loopback => {
            let endpoint = reqwest::Url::parse(&format!("http://{}/mcp", loopback_addr(local_addr)))
                .context("building loopback endpoint url")?;
            info!(target: "bridge", "loopback delivery to {}", endpoint);
            Arc::new(LoopbackDelivery::new(endpoint, settings.bridge_timeout).map_err(|e| anyhow::anyhow!(e))?)
        }
    };
    let bridge = Arc::new(Bridge::new(delivery, settings.bridge_timeout));
    Ok(AppState { app_name: settings.app_name.clone(), sessions, dispatcher, bridge })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/status", get(status))
        .route("/list_files", get(list_files_route))
        .route("/get_file_content", get(get_file_content_route))
        .route("/get_site_info", get(get_site_info_route))
        .route("/mcp", post(rpc_handler))
        .route("/mcp/list_files", get(list_files_route))
        .route("/mcp/get_file_content", get(get_file_content_route))
        .route("/mcp/get_site_info", get(get_site_info_route))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> String {
    format!("{} ok", state.app_name)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let ctx = state.sessions.current();
    Json(json!({
        "status": "ok",
        "app": state.app_name,
        "delivery": state.bridge.delivery_name(),
        "refresh": state.sessions.policy().as_str(),
        "session": {
            "valid": ctx.is_valid(Utc::now()),
            "degraded": ctx.is_degraded(),
            "expires_at": ctx.expires_at().to_rfc3339(),
        }
    }))
}

fn bridge_failure(e: &BridgeError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": e.message}))).into_response()
}

/// Relay a simple call through the bridge and shape the HTTP answer.
async fn relay(state: &AppState, method: &str, args: Map<String, Value>) -> Response {
    let call = state.bridge.call(method, args);
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => (StatusCode::OK, Json(value)).into_response(),
        Ok(Err(e)) => {
            error!(target: "bridge", "{} failed ({}): {}", method, e.code, e.message);
            bridge_failure(&e)
        }
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() { *s }
                      else if let Some(s) = panic_payload.downcast_ref::<String>() { s.as_str() }
                      else { "panic" };
            error!(target: "panic", "{} handler panic: {}", method, msg);
            bridge_failure(&BridgeError::new(500, format!("internal error: {msg}")))
        }
    }
}

fn args_from_query(query: &HashMap<String, String>, keys: &[&str]) -> Map<String, Value> {
    let mut args = Map::new();
    for k in keys {
        if let Some(v) = query.get(*k) {
            args.insert((*k).to_string(), Value::String(v.clone()));
        }
    }
    args
}

async fn list_files_route(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    relay(&state, "list_files", args_from_query(&query, &["folder"])).await
}

async fn get_file_content_route(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    relay(&state, "get_file_content", args_from_query(&query, &["filename"])).await
}

async fn get_site_info_route(State(state): State<AppState>) -> Response {
    relay(&state, "get_site_info", Map::new()).await
}

async fn rpc_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let req = match parse_request(&body) {
        Ok(req) => req,
        Err(resp) => return (StatusCode::OK, Json(resp)).into_response(),
    };
    match state.dispatcher.dispatch(req).await {
        Some(resp) => (StatusCode::OK, Json(resp)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c received; shutting down"),
        _ = terminate => info!("SIGTERM received; shutting down"),
    }
}

/// Serve until `shutdown` resolves, then stop the session whatever the outcome.
async fn serve_until<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let sessions = state.sessions.clone();
    let app = router(state);
    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    sessions.stop().await;
    result.context("http server error")
}

/// A server running on a background task.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ServerHandle {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", loopback_addr(self.addr), path)
    }

    /// Trigger graceful shutdown and wait for the session teardown.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("server task panicked")?
    }
}

/// Start the full stack on `listener` with the given collaborators. The session
/// is acquired before this returns.
pub async fn spawn(
    settings: &Settings,
    listener: TcpListener,
    source: Arc<dyn CredentialSource>,
    repository: Arc<dyn DocumentRepository>,
) -> anyhow::Result<ServerHandle> {
    let addr = listener.local_addr()?;
    let sessions = Arc::new(
        SessionLifecycle::new(source, &settings.graph_url, settings.refresh, settings.degraded_ttl)
            .with_acquire_timeout(settings.acquire_timeout),
    );
    sessions.start().await;
    let state = match assemble(settings, addr, sessions.clone(), repository) {
        Ok(state) => state,
        Err(e) => {
            sessions.stop().await;
            return Err(e);
        }
    };
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(serve_until(listener, state.clone(), async move {
        let _ = rx.await;
    }));
    Ok(ServerHandle { addr, state, shutdown: Some(tx), task })
}

/// Start the docbridge server with settings read from the environment, serving
/// until Ctrl-C or SIGTERM.
pub async fn run_with_settings(settings: Settings) -> anyhow::Result<()> {
    info!(
        target: "startup",
        "Starting {} server: bind={}, delivery={}, refresh={}, bridge_timeout={:?}, acquire_timeout={:?}, graph_url={}, credentials_configured={}, site_url={:?}",
        settings.app_name,
        settings.bind_addr(),
        settings.delivery.as_str(),
        settings.refresh.as_str(),
        settings.bridge_timeout,
        settings.acquire_timeout,
        settings.graph_url,
        settings.credentials.is_complete(),
        settings.site_url
    );

    let source: Arc<dyn CredentialSource> = Arc::new(
        ClientCredentialSource::from_settings(&settings).map_err(|e| anyhow::anyhow!(e))?,
    );
    let repository: Arc<dyn DocumentRepository> = Arc::new(GraphRepository::from_settings(&settings)?);
    let sessions = Arc::new(
        SessionLifecycle::new(source, &settings.graph_url, settings.refresh, settings.degraded_ttl)
            .with_acquire_timeout(settings.acquire_timeout),
    );
    sessions.start().await;

    let listener = match TcpListener::bind(settings.bind_addr()).await {
        Ok(l) => l,
        Err(e) => {
            sessions.stop().await;
            return Err(e).with_context(|| format!("failed to bind {}", settings.bind_addr()));
        }
    };
    let addr = listener.local_addr()?;
    let state = match assemble(&settings, addr, sessions.clone(), repository) {
        Ok(state) => state,
        Err(e) => {
            sessions.stop().await;
            return Err(e);
        }
    };
    info!("Starting server on {}", addr);
    serve_until(listener, state, shutdown_signal()).await
}

/// Convenience entry point using the environment.
pub async fn run() -> anyhow::Result<()> {
    run_with_settings(Settings::from_env()).await
}
