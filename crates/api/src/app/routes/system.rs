use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(tenant): Extension<TenantContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "tenant_id": tenant.tenant_id().to_string(),
    }))
}

/// Replays the tenant's streams into fresh listing and directory rows.
pub async fn rebuild_read_models(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.discounting.rebuild_read_models(tenant.tenant_id()) {
        Ok(replayed) => Json(serde_json::json!({ "events_replayed": replayed })).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
