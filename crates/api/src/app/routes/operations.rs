use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};

use factorops_factoring::{FactorId, FactorOperationId, ItemId};
use factorops_infra::NewItem;
use factorops_infra::bundle::BundleSelector;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_operation).get(list_operations))
        .route("/:id", get(get_operation).put(update_operation))
        .route("/:id/items", post(add_item))
        .route("/:id/items/:item_id", delete(remove_item))
        .route("/:id/versions", post(generate_version).get(list_versions))
        .route("/:id/send", post(send_to_factor))
        .route("/:id/responses", post(apply_responses))
        .route("/:id/conclude", post(conclude))
        .route("/:id/cancel", post(cancel))
        .route("/:id/bundle", get(export_bundle))
}

fn operation_id(raw: &str) -> Result<FactorOperationId, axum::response::Response> {
    errors::parse_id(raw, "operation id").map(FactorOperationId::new)
}

fn operation_response(
    result: Result<factorops_factoring::FactorOperation, factorops_infra::ServiceError>,
    status: StatusCode,
) -> axum::response::Response {
    match result {
        Ok(op) => (status, Json(dto::OperationResponse::from(&op))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn create_operation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::CreateOperationRequest>,
) -> axum::response::Response {
    let factor_id = match body.factor_id.as_deref() {
        Some(raw) => match errors::parse_id(raw, "factor id") {
            Ok(agg) => Some(FactorId::new(agg)),
            Err(resp) => return resp,
        },
        None => None,
    };
    operation_response(
        services
            .discounting
            .create_operation(tenant.tenant_id(), factor_id, body.details),
        StatusCode::CREATED,
    )
}

pub async fn list_operations(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    Json(services.discounting.list_operations(tenant.tenant_id())).into_response()
}

pub async fn get_operation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    operation_response(
        services.discounting.get_operation(tenant.tenant_id(), op_id),
        StatusCode::OK,
    )
}

pub async fn update_operation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateOperationRequest>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    operation_response(
        services
            .discounting
            .update_details(tenant.tenant_id(), op_id, body.details),
        StatusCode::OK,
    )
}

pub async fn add_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AddItemRequest>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let new_item = NewItem {
        action_type: body.action_type,
        installment_id: body.installment_id,
        proposed_due_date: body.proposed_due_date,
    };
    match services.discounting.add_item(tenant.tenant_id(), op_id, new_item) {
        Ok(item) => (StatusCode::CREATED, Json(item)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn remove_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path((id, item_id)): Path<(String, String)>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let item_id: ItemId = match errors::parse_id(&item_id, "item id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    operation_response(
        services.discounting.remove_item(tenant.tenant_id(), op_id, item_id),
        StatusCode::OK,
    )
}

pub async fn generate_version(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.discounting.generate_version(tenant.tenant_id(), op_id) {
        Ok(version) => (StatusCode::CREATED, Json(version)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_versions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.discounting.list_versions(tenant.tenant_id(), op_id) {
        Ok(versions) => Json(dto::VersionsResponse {
            operation_id: op_id,
            versions,
        })
        .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn send_to_factor(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    operation_response(
        services.discounting.send_to_factor(tenant.tenant_id(), op_id),
        StatusCode::OK,
    )
}

pub async fn apply_responses(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ApplyResponsesRequest>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    operation_response(
        services
            .discounting
            .apply_responses(tenant.tenant_id(), op_id, body.version_id, body.responses),
        StatusCode::OK,
    )
}

/// Body is optional. Repeating the call on a completed operation answers 200 with
/// `idempotent: true`.
pub async fn conclude(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::ConcludeRequest>>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match services.discounting.conclude(
        tenant.tenant_id(),
        op_id,
        body.expected_settlement_date,
        body.notes,
    ) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::CancelRequest>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    operation_response(
        services.discounting.cancel(tenant.tenant_id(), op_id, &body.reason),
        StatusCode::OK,
    )
}

pub async fn export_bundle(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Query(q): Query<dto::BundleQuery>,
) -> axum::response::Response {
    let op_id = match operation_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let selector = match q.selector.as_deref() {
        None => BundleSelector::All,
        Some(raw) => match raw.parse::<BundleSelector>() {
            Ok(s) => s,
            Err(e) => return errors::service_error_to_response(e.into()),
        },
    };
    match services.discounting.export_bundle(tenant.tenant_id(), op_id, selector) {
        Ok(bundle) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, bundle.content_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", bundle.file_name),
                ),
            ],
            bundle.bytes,
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
