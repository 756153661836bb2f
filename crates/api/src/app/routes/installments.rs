use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    response::IntoResponse,
    routing::get,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/eligible", get(list_eligible))
        .route("/custody", get(list_in_custody))
}

pub async fn list_eligible(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(q): Query<dto::EligibleQuery>,
) -> axum::response::Response {
    match services
        .discounting
        .eligible_installments(tenant.tenant_id(), q.search.as_deref())
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_in_custody(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.discounting.custody_installments(tenant.tenant_id()) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
