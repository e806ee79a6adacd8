//! The agent's HTTP surface: `POST /v1/events`, `GET /v1/health`, and
//! `GET /metrics`, wired the way `crates/nest`'s axum apps are wired.
//! Grounded in the original `agent/main.py`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use tracegate_config::AgentConfig;
use tracegate_db::enums::OutboxEventType;

use crate::error::AgentError;
use crate::state::AgentStateStore;
use crate::system::gather_health_checks;

#[derive(Clone)]
pub struct AgentState {
	pub config: Arc<AgentConfig>,
	pub store: Arc<AgentStateStore>,
}

#[derive(Deserialize)]
struct EventEnvelope {
	event_id: Uuid,
	idempotency_key: String,
	event_type: OutboxEventType,
	payload: Value,
}

#[derive(Serialize)]
struct EventResponse {
	accepted: bool,
	duplicate: bool,
	message: String,
}

#[derive(Serialize)]
struct HealthCheckRow {
	name: String,
	ok: bool,
	details: String,
}

#[derive(Serialize)]
struct HealthResponse {
	role: String,
	checks: Vec<HealthCheckRow>,
	overall_ok: bool,
}

const AGENT_TOKEN_HEADER: &str = "x-agent-token";

async fn require_agent_token(State(state): State<AgentState>, headers: HeaderMap, request: Request, next: Next) -> Result<Response, AgentError> {
	let presented = headers.get(AGENT_TOKEN_HEADER).and_then(|v| v.to_str().ok());
	match presented {
		Some(token) if token == state.config.agent_auth_token => Ok(next.run(request).await),
		_ => Err(AgentError::Unauthorized),
	}
}

async fn receive_event(State(state): State<AgentState>, Json(event): Json<EventEnvelope>) -> Result<Json<EventResponse>, AgentError> {
	let event_id = event.event_id.to_string();
	if state.store.seen(&event_id).await? {
		return Ok(Json(EventResponse { accepted: true, duplicate: true, message: "event already processed".to_string() }));
	}

	let message = crate::handlers::dispatch_event(&state.config, &state.store, event.event_type, &event.payload).await?;
	state.store.mark(&event_id, &event.idempotency_key).await?;
	Ok(Json(EventResponse { accepted: true, duplicate: false, message }))
}

async fn health(State(state): State<AgentState>) -> Json<HealthResponse> {
	let rows = gather_health_checks(&state.config.stats_url, &state.config.stats_secret, &state.config.wg_interface, state.config.wg_expected_port, &state.config.role).await;
	let overall_ok = rows.iter().all(|r| r.ok);
	let checks = rows.into_iter().map(|r| HealthCheckRow { name: r.name, ok: r.ok, details: r.details }).collect();
	Json(HealthResponse { role: state.config.role.clone(), checks, overall_ok })
}

async fn metrics(State(state): State<AgentState>) -> Response {
	if state.config.role == "VPS_T" {
		crate::metrics::refresh_wireguard_gauges(std::path::Path::new(&state.config.data_root), &state.config.wg_interface);
	}
	match crate::metrics::gather_text() {
		Ok(text) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
}

pub fn router(state: AgentState) -> Router {
	let authenticated = Router::new()
		.route("/v1/events", post(receive_event))
		.route("/metrics", get(metrics))
		.layer(middleware::from_fn_with_state(state.clone(), require_agent_token));

	Router::new().route("/v1/health", get(health)).merge(authenticated).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http())).with_state(state)
}
