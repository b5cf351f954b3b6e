//! Device-facing endpoints: bundle lookup and download slots.

use std::fmt::Write as _;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::error::DomainError;
use crate::AppState;

/// Cookie-syntax device attribute header (`sn=SN001; mac.eth0=..`).
pub const DEVICE_HEADER: &str = "x-fab-dut";

/// Bundle assignment for one device, as line-oriented `key: value` text.
#[utoipa::path(
    get,
    path = "/fab/resolve",
    tag = "Device",
    responses((status = 200, body = String), (status = 400))
)]
pub async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, DomainError> {
    let raw = match headers.get(DEVICE_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| DomainError::UnreadableDeviceHeader)?,
        None => "",
    };
    let attrs = fab_config::parse_device_header(raw)?;
    let config = state.config().ok_or(DomainError::NoActiveConfig)?;
    let bundle = fab_config::resolve_bundle(&config, &attrs)
        .ok_or_else(|| DomainError::UnknownBundle(config.active_bundle_id.clone()))?;

    let mut body = String::new();
    let _ = writeln!(body, "id: {}", bundle.id);
    let _ = writeln!(body, "note: {}", bundle.note);
    let _ = writeln!(body, "payloads: {}", bundle.payloads);
    if let Some(multicast) = config.services.multicast.as_ref().filter(|m| m.active) {
        if let Some(mgroup) = &multicast.mgroup {
            let _ = writeln!(body, "multicast.mgroup: {mgroup}");
        }
        if let Some(port) = multicast.port {
            let _ = writeln!(body, "multicast.port: {port}");
        }
    }
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    ))
}

#[derive(Deserialize, ToSchema)]
pub struct SlotRequest {
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Acquire a download slot before starting a large transfer.
#[utoipa::path(
    post,
    path = "/fab/slots",
    tag = "Device",
    request_body = SlotRequest,
    responses((status = 200, body = serde_json::Value), (status = 400), (status = 429))
)]
pub async fn acquire_slot(
    State(state): State<AppState>,
    Json(req): Json<SlotRequest>,
) -> Result<impl IntoResponse, DomainError> {
    let device_id = req
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(DomainError::MissingField("device_id"))?;
    let grant = state.slots().acquire(device_id)?;
    Ok(Json(json!({
        "token": grant.token,
        "ttl_secs": grant.ttl_secs,
        "in_use": state.slots().in_use(),
        "capacity": state.slots().capacity(),
    })))
}

/// Release a download slot early.
#[utoipa::path(
    delete,
    path = "/fab/slots/{token}",
    tag = "Device",
    responses((status = 204), (status = 404))
)]
pub async fn release_slot(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, DomainError> {
    state.slots().release(&token)?;
    Ok(StatusCode::NO_CONTENT)
}
