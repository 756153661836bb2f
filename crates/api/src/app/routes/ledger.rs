use std::sync::Arc;

use axum::{Json, Router, extract::Extension, response::IntoResponse, routing::get};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/postings", get(list_postings))
}

/// Active settlement postings with their journal lines.
pub async fn list_postings(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.discounting.ledger_postings(tenant.tenant_id()) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
