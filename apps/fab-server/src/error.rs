//! Domain error: a well-formed request that violates a deployment invariant.
//!
//! Every variant maps to a 4xx (or 503) response at the HTTP boundary; only
//! genuine I/O trouble becomes a 500. Handlers return `Result<_, DomainError>`
//! and the conversion happens once, here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::ServiceError;
use fab_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("unknown bundle `{0}`")]
    UnknownBundle(String),
    #[error("unknown payload kind `{0}`")]
    UnknownPayloadKind(String),
    #[error("bad device header: {0}")]
    BadDeviceHeader(#[from] fab_config::HeaderError),
    #[error("device header is not valid text")]
    UnreadableDeviceHeader,
    #[error(transparent)]
    InvalidConfig(#[from] fab_config::ValidationError),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("nothing staged")]
    NothingStaged,
    #[error("deploy already in progress")]
    DeployInProgress,
    #[error("no active configuration")]
    NoActiveConfig,
    #[error("download slots exhausted")]
    SlotsExhausted,
    #[error("unknown download slot `{0}`")]
    UnknownSlot(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payload tool failed: {0}")]
    PayloadTool(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DomainError {
    fn status(&self) -> StatusCode {
        match self {
            DomainError::UnknownBundle(_)
            | DomainError::UnknownPayloadKind(_)
            | DomainError::NothingStaged
            | DomainError::UnknownSlot(_)
            | DomainError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            DomainError::BadDeviceHeader(_)
            | DomainError::UnreadableDeviceHeader
            | DomainError::MissingField(_)
            | DomainError::Store(StoreError::MalformedName { .. }) => StatusCode::BAD_REQUEST,
            DomainError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DomainError::DeployInProgress => StatusCode::CONFLICT,
            DomainError::Service(ServiceError::PortConflict { .. }) => StatusCode::CONFLICT,
            DomainError::SlotsExhausted => StatusCode::TOO_MANY_REQUESTS,
            DomainError::NoActiveConfig => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self.status() {
            StatusCode::NOT_FOUND => "Not Found",
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::UNPROCESSABLE_ENTITY => "Invalid Configuration",
            StatusCode::CONFLICT => "Conflict",
            StatusCode::TOO_MANY_REQUESTS => "Too Many Requests",
            StatusCode::SERVICE_UNAVAILABLE => "Service Unavailable",
            _ => "Internal Error",
        }
    }
}

impl IntoResponse for DomainError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(json!({
                "type": "about:blank",
                "title": self.title(),
                "status": status.as_u16(),
                "detail": self.to_string(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violations_map_to_4xx() {
        assert_eq!(
            DomainError::UnknownBundle("b9".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DomainError::MissingField("device_id").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DomainError::DeployInProgress.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DomainError::SlotsExhausted.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            DomainError::Service(ServiceError::PortConflict {
                port: 8084,
                first: "file_transfer".into(),
                second: "key_dispenser".into(),
            })
            .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn store_not_found_recovers_as_404() {
        let err = DomainError::Store(StoreError::NotFound("ghost#1#00112233".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
