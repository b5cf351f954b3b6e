use axum::routing::{delete, get, post};
use axum::Router;

use crate::{api_admin, api_dut, AppState};

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/fab/resolve", get(api_dut::resolve))
        .route("/fab/slots", post(api_dut::acquire_slot))
        .route("/fab/slots/{token}", delete(api_dut::release_slot))
        .route("/admin/status", get(api_admin::status))
        .route("/admin/configs", post(api_admin::store_config))
        .route("/admin/deploy", post(api_admin::deploy))
        .route("/admin/export-payload", post(api_admin::export_payload))
        .route("/admin/sync", post(api_admin::sync_push))
}
