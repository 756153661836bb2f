use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use factorops_factoring::FactorId;
use factorops_infra::{FactorInput, FactorPatch};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(register_factor).get(list_factors))
        .route("/:id", get(get_factor).put(update_factor))
        .route("/:id/deactivate", post(deactivate_factor))
}

pub async fn register_factor(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::CreateFactorRequest>,
) -> axum::response::Response {
    let input = FactorInput {
        name: body.name,
        code: body.code,
        terms: body.terms,
    };
    match services.discounting.register_factor(tenant.tenant_id(), input) {
        Ok(f) => (StatusCode::CREATED, Json(dto::FactorResponse::from(&f))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_factors(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    Json(services.discounting.list_factors(tenant.tenant_id())).into_response()
}

pub async fn get_factor(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let factor_id = match errors::parse_id(&id, "factor id") {
        Ok(agg) => FactorId::new(agg),
        Err(resp) => return resp,
    };
    match services.discounting.get_factor(tenant.tenant_id(), factor_id) {
        Ok(f) => Json(dto::FactorResponse::from(&f)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn update_factor(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateFactorRequest>,
) -> axum::response::Response {
    let factor_id = match errors::parse_id(&id, "factor id") {
        Ok(agg) => FactorId::new(agg),
        Err(resp) => return resp,
    };
    let patch = FactorPatch {
        name: body.name,
        code: body.code,
        terms: body.terms,
    };
    match services.discounting.update_factor(tenant.tenant_id(), factor_id, patch) {
        Ok(f) => Json(dto::FactorResponse::from(&f)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn deactivate_factor(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let factor_id = match errors::parse_id(&id, "factor id") {
        Ok(agg) => FactorId::new(agg),
        Err(resp) => return resp,
    };
    match services.discounting.deactivate_factor(tenant.tenant_id(), factor_id) {
        Ok(f) => Json(dto::FactorResponse::from(&f)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
