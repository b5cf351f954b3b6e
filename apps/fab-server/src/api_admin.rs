//! Operator RPC surface: status, configuration staging and deploy, payload
//! export, and the cross-server sync receiver.

use std::io::Write as _;
use std::path::Path;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use utoipa::ToSchema;

use crate::activator;
use crate::deploy;
use crate::error::DomainError;
use crate::payloads;
use crate::AppState;
use fab_config::DeployConfig;

/// Server status: board, activation state, pointers, service health.
#[utoipa::path(
    get,
    path = "/admin/status",
    tag = "Admin",
    responses((status = 200, body = serde_json::Value))
)]
pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, DomainError> {
    let env = state.env();
    let config = state.config();
    Ok(Json(json!({
        "board": config.as_ref().and_then(|c| c.board.clone()),
        "state": activator::deploy_state(env)?.as_str(),
        "deploying": state.is_deploying(),
        "active": {
            "resource": activator::active_resource(env)?,
            "config": activator::read_active_text(env)?,
        },
        "staging": {
            "resource": activator::staged_resource(env)?,
        },
        "services": state.registry().statuses().await,
        "slots": {
            "in_use": state.slots().in_use(),
            "capacity": state.slots().capacity(),
        },
    })))
}

/// Validate, store, and stage a candidate configuration. The body is the
/// configuration text itself; it is re-encoded canonically before storage so
/// logically identical configurations deduplicate.
#[utoipa::path(
    post,
    path = "/admin/configs",
    tag = "Admin",
    request_body = String,
    responses((status = 200, body = serde_json::Value), (status = 422))
)]
pub async fn store_config(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, DomainError> {
    let config = DeployConfig::parse(&body)?;
    let resource = activator::store_config(state.env(), &config.to_canonical_string())?;
    activator::stage(state.env(), &resource.to_string())?;
    info!(target: "fab::deploy", resource = %resource, "configuration stored and staged");
    Ok(Json(json!({
        "resource": resource.to_string(),
        "state": "staged",
    })))
}

/// Promote the staged configuration and reconcile services.
#[utoipa::path(
    post,
    path = "/admin/deploy",
    tag = "Admin",
    responses((status = 200, body = serde_json::Value), (status = 404), (status = 409))
)]
pub async fn deploy(State(state): State<AppState>) -> Result<impl IntoResponse, DomainError> {
    let outcome = deploy::deploy_staged(&state).await?;
    Ok(Json(json!({
        "resource": outcome.resource,
        "services": outcome.services,
    })))
}

#[derive(Deserialize, ToSchema)]
pub struct ExportPayloadRequest {
    pub bundle_id: String,
    pub payload_kind: String,
    pub dest_path: String,
}

/// Materialize one payload of one bundle at a caller-given path via the
/// external payload tool.
#[utoipa::path(
    post,
    path = "/admin/export-payload",
    tag = "Admin",
    request_body = ExportPayloadRequest,
    responses((status = 200, body = serde_json::Value), (status = 404))
)]
pub async fn export_payload(
    State(state): State<AppState>,
    Json(req): Json<ExportPayloadRequest>,
) -> Result<impl IntoResponse, DomainError> {
    let config = state.config().ok_or(DomainError::NoActiveConfig)?;
    let resource = payloads::export_payload(
        state.env(),
        &config,
        &req.bundle_id,
        &req.payload_kind,
        Path::new(&req.dest_path),
    )
    .await?;
    Ok(Json(json!({
        "bundle_id": req.bundle_id,
        "payload_kind": req.payload_kind,
        "resource": resource,
        "dest_path": req.dest_path,
    })))
}

/// Receiver for a secondary's bundle-state push. Records the last push so
/// operators can compare primaries and secondaries.
#[utoipa::path(
    post,
    path = "/admin/sync",
    tag = "Admin",
    request_body = serde_json::Value,
    responses((status = 200, body = serde_json::Value))
)]
pub async fn sync_push(
    State(state): State<AppState>,
    Json(push): Json<Value>,
) -> Result<impl IntoResponse, DomainError> {
    let env = state.env();
    let sync_dir = env.data_dir().join("sync");
    std::fs::create_dir_all(&sync_dir)?;
    let record = json!({
        "received_at": Utc::now().to_rfc3339(),
        "push": push,
    });
    let mut tmp = tempfile::NamedTempFile::new_in(&sync_dir)?;
    tmp.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
    tmp.persist(sync_dir.join("last_push.json"))
        .map_err(|err| DomainError::Io(err.error))?;
    Ok(Json(json!({"ok": true})))
}
