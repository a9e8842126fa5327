//! HTTP trigger surface: the scheduled cron entry point plus manual triggers.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{MoveRequest, OrganizeRequest, Orchestrator, PreviewRequest};
use crate::error::DatabaseError;
use crate::rules::{NewRule, ReadFilter};

/// Default and maximum page size of `/api/logs`.
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Bearer secret; `None` rejects every protected request.
    pub cron_secret: Option<SecretString>,
}

/// Build the router. Everything except `/health` requires the bearer secret.
pub fn routes(orchestrator: Arc<Orchestrator>, cron_secret: Option<SecretString>) -> Router {
    let state = AppState {
        orchestrator,
        cron_secret,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/cron", get(cron))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/sync", post(sync_rules))
        .route("/api/rules/read-filter", post(set_read_filter))
        .route("/api/rules/{id}", put(update_rule).delete(delete_rule))
        .route("/api/rules/{id}/active", post(set_rule_active))
        .route("/api/rules/{id}/run", post(run_rule))
        .route("/api/logs", get(recent_logs))
        .route("/api/scan", post(preview))
        .route("/api/move", post(move_messages))
        .route("/api/organize", post(organize))
        .route("/api/folders", get(list_folders))
        .route("/api/folders/setup", post(setup_folders))
        .route("/api/folders/reset", post(reset_folders))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Auth ────────────────────────────────────────────────────────────────

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(secret) = state.cron_secret.as_ref() else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented.trim() == secret.expose_secret())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"success": false, "error": "Unauthorized"})),
    )
        .into_response()
}

/// 200 on success, 500 otherwise, with the outcome as the body.
fn outcome_response<T: Serialize>(success: bool, outcome: &T) -> Response {
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(serde_json::json!(outcome))).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"success": false, "error": message.into()})),
    )
        .into_response()
}

fn store_error(e: DatabaseError) -> Response {
    let status = match &e {
        DatabaseError::NotFound { .. } => StatusCode::NOT_FOUND,
        DatabaseError::Constraint(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %e, "Rule store request failed");
    (
        status,
        Json(serde_json::json!({"success": false, "error": e.to_string()})),
    )
        .into_response()
}

fn parse_rule_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| bad_request("Invalid rule ID"))
}

/// Decode a JSON body; an empty body yields `T::default()` when `default` is set.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes, default: bool) -> Result<T, Response> {
    if default && body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("Invalid request: {e}")))
}

fn validate_rule(rule: &NewRule) -> Result<(), Response> {
    if rule.name.trim().is_empty() {
        return Err(bad_request("Rule name is required"));
    }
    if rule.target_folder.trim().is_empty() {
        return Err(bad_request("Target folder is required"));
    }
    Ok(())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "clean-mail"
    }))
}

// ── Triggers ────────────────────────────────────────────────────────────

async fn cron(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        warn!("Rejected cron trigger with bad credentials");
        return unauthorized();
    }
    info!("Cron trigger received");
    let outcome = state.orchestrator.run_all_active_rules().await;
    outcome_response(outcome.success, &outcome)
}

#[derive(Debug, Deserialize)]
struct RunParams {
    from_year: Option<i32>,
}

async fn run_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<RunParams>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let rule_id = match parse_rule_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let outcome = state.orchestrator.run_rule(rule_id, params.from_year).await;
    outcome_response(outcome.success, &outcome)
}

async fn sync_rules(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let outcome = state.orchestrator.sync_provider_rules().await;
    outcome_response(outcome.success, &outcome)
}

async fn organize(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    // An empty body means "all active rules, default source".
    let request: OrganizeRequest = match parse_body(&body, true) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let outcome = state.orchestrator.organize(request).await;
    outcome_response(outcome.success, &outcome)
}

async fn preview(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let request: PreviewRequest = match parse_body(&body, true) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let outcome = state.orchestrator.preview(request).await;
    outcome_response(outcome.success, &outcome)
}

async fn move_messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let request: MoveRequest = match parse_body(&body, false) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let outcome = state.orchestrator.move_messages(request).await;
    outcome_response(outcome.success, &outcome)
}

// ── Rule management ─────────────────────────────────────────────────────

async fn list_rules(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match state.orchestrator.rule_store().list_rules().await {
        Ok(rules) => Json(serde_json::json!({"success": true, "rules": rules})).into_response(),
        Err(e) => store_error(e),
    }
}

async fn create_rule(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let new_rule: NewRule = match parse_body(&body, false).and_then(|r| validate_rule(&r).map(|()| r)) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let rule = new_rule.into_rule();
    match state.orchestrator.rule_store().insert_rule(&rule).await {
        Ok(()) => {
            info!(rule = %rule.name, "Rule created");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"success": true, "rule": rule})),
            )
                .into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn update_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let rule_id = match parse_rule_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let update: NewRule = match parse_body(&body, false).and_then(|r| validate_rule(&r).map(|()| r)) {
        Ok(r) => r,
        Err(response) => return response,
    };
    match state.orchestrator.rule_store().update_rule(rule_id, &update).await {
        Ok(rule) => Json(serde_json::json!({"success": true, "rule": rule})).into_response(),
        Err(e) => store_error(e),
    }
}

async fn delete_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let rule_id = match parse_rule_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.rule_store().delete_rule(rule_id).await {
        Ok(true) => {
            info!(%rule_id, "Rule deleted");
            Json(serde_json::json!({"success": true})).into_response()
        }
        Ok(false) => store_error(DatabaseError::NotFound {
            entity: "rule".into(),
            id: rule_id.to_string(),
        }),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ActiveRequest {
    active: bool,
}

async fn set_rule_active(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let rule_id = match parse_rule_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let request: ActiveRequest = match parse_body(&body, false) {
        Ok(r) => r,
        Err(response) => return response,
    };
    match state
        .orchestrator
        .rule_store()
        .set_rule_active(rule_id, request.active)
        .await
    {
        Ok(()) => Json(serde_json::json!({"success": true, "active": request.active})).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReadFilterRequest {
    read_filter: ReadFilter,
}

async fn set_read_filter(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let request: ReadFilterRequest = match parse_body(&body, false) {
        Ok(r) => r,
        Err(response) => return response,
    };
    match state
        .orchestrator
        .rule_store()
        .set_read_filter_all(request.read_filter)
        .await
    {
        Ok(changed) => Json(serde_json::json!({"success": true, "changed": changed})).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct LogParams {
    limit: Option<usize>,
}

async fn recent_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LogParams>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    match state.orchestrator.log_store().recent_logs(limit).await {
        Ok(logs) => Json(serde_json::json!({"success": true, "logs": logs})).into_response(),
        Err(e) => store_error(e),
    }
}

async fn list_folders(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let outcome = state.orchestrator.list_folders().await;
    outcome_response(outcome.success, &outcome)
}

#[derive(Debug, Deserialize)]
struct SetupRequest {
    paths: Vec<String>,
}

async fn setup_folders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SetupRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let outcome = state.orchestrator.setup_folders(&req.paths).await;
    outcome_response(outcome.success, &outcome)
}

async fn reset_folders(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    warn!("Resetting every organized folder back to Inbox");
    let outcome = state.orchestrator.reset_to_inbox().await;
    outcome_response(outcome.success, &outcome)
}
