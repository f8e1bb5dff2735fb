//! HTTP / WebSocket API
//!
//! REST operations over the pet service plus the real-time `/ws` channel.
//! Handlers hold no state of their own; everything goes through `AppState`.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::monitor::MonitorStatus;
use crate::core::service::ThreatReport;
use crate::core::state::AppState;
use crate::io::hub::Frame;
use crate::io::messages::reply_to_client;

// --- Request Types ---

#[derive(Debug, Deserialize)]
pub struct EventForm {
    pub event: String,
}

#[derive(Debug, Deserialize)]
pub struct GoodBehaviorRequest {
    #[serde(default = "default_time_safe")]
    pub time_safe: u64,
}

fn default_time_safe() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct SetHealthRequest {
    #[serde(default = "default_health")]
    pub health: i64,
}

fn default_health() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct TriggerThreatRequest {
    #[serde(default = "default_test_severity")]
    pub severity: i64,
    #[serde(default = "default_test_threat")]
    pub threat_type: String,
}

fn default_test_severity() -> i64 {
    75
}

fn default_test_threat() -> String {
    "test_threat".to_string()
}

// --- Handler Functions ---

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "service": "cyberpet",
        "version": env!("CARGO_PKG_VERSION"),
        "pet_state": state.service.snapshot(),
        "monitoring_active": state.monitor.is_running().await,
        "clients": state.service.hub().len(),
    }))
}

async fn get_pet(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.snapshot())
}

async fn post_event(State(state): State<AppState>, Form(form): Form<EventForm>) -> impl IntoResponse {
    Json(state.service.submit_event(&form.event))
}

async fn security_event(
    State(state): State<AppState>,
    Json(report): Json<ThreatReport>,
) -> impl IntoResponse {
    info!(threat = %report.threat_type, severity = report.severity, "security event received");
    Json(state.service.submit_threat(&report))
}

async fn good_behavior(
    State(state): State<AppState>,
    Json(request): Json<GoodBehaviorRequest>,
) -> impl IntoResponse {
    Json(state.service.credit_good_behavior(request.time_safe))
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    Json(serde_json::json!({ "events": state.service.recent_events(query.limit) }))
}

fn monitor_reply(state: &AppState, status: MonitorStatus) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": status,
        "message": status.message(state.monitor.timing()),
    }))
}

async fn start_monitoring(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.monitor.start().await;
    monitor_reply(&state, status)
}

async fn stop_monitoring(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.monitor.stop().await;
    monitor_reply(&state, status)
}

async fn monitoring_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "monitoring_active": state.monitor.is_running().await,
        "screenshot_interval": state.monitor.timing().interval.as_secs(),
        "checks": state.monitor.checks(),
        "pet_state": state.service.snapshot(),
    }))
}

async fn trigger_threat(
    State(state): State<AppState>,
    Json(request): Json<TriggerThreatRequest>,
) -> impl IntoResponse {
    let report = ThreatReport {
        threat_type: request.threat_type,
        severity: request.severity,
        metadata: [("reason".to_string(), serde_json::Value::from("Test threat"))]
            .into_iter()
            .collect(),
    };
    let response = state.service.submit_threat(&report);
    Json(serde_json::json!({ "success": true, "pet_state": response.pet_state }))
}

async fn reset_pet(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "reset", "pet_state": state.service.reset() }))
}

async fn set_health(
    State(state): State<AppState>,
    Json(request): Json<SetHealthRequest>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "updated",
        "pet_state": state.service.set_health(request.health),
    }))
}

// --- WebSocket ---

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, false))
}

async fn demo_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, true))
}

/// One task per client: a writer draining the client's queue into the socket,
/// and this task reading inbound text until the socket closes.
async fn handle_websocket(socket: WebSocket, state: AppState, demo: bool) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(state.config.server.client_queue.max(1));

    let service = state.service.clone();
    let id = match service.connect_client(tx) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "could not register client");
            return;
        }
    };
    if demo {
        service.announce_snapshot();
    }

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !demo {
                        let reply = reply_to_client(text.as_str());
                        service.hub().send_to(id, reply.to_frame());
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = %id, error = %e, "websocket read failed");
                    break;
                }
            }
        }
    }

    service.hub().disconnect(id);
    writer.abort();
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health_check))
        .route("/healthz", get(health_check))
        .route("/pet", get(get_pet))
        .route("/api/pet-state", get(get_pet))
        .route("/pet/event", post(post_event))
        .route("/api/security-event", post(security_event))
        .route("/api/good-behavior", post(good_behavior))
        .route("/api/events/recent", get(recent_events))
        .route("/api/monitoring/start", post(start_monitoring))
        .route("/api/monitoring/stop", post(stop_monitoring))
        .route("/api/monitoring/status", get(monitoring_status))
        .route("/api/test/trigger-threat", post(trigger_threat))
        .route("/api/demo/reset-pet", post(reset_pet))
        .route("/api/demo/set-health", post(set_health))
        .route("/ws", get(websocket_handler))
        .route("/ws/demo", get(demo_websocket_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Serve on an already-bound listener until the server fails.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "API server listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Start the API server
pub async fn start_server(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.bind, state.config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve(listener, state).await
}
