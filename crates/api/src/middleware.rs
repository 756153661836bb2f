use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use factorops_core::TenantId;

use crate::app::errors;
use crate::context::TenantContext;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Resolve the tenant from `x-tenant-id` and attach it to the request.
pub async fn tenant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let tenant_id = match extract_tenant(req.headers()) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    req.extensions_mut().insert(TenantContext::new(tenant_id));
    next.run(req).await
}

fn extract_tenant(headers: &HeaderMap) -> Result<TenantId, Response> {
    let header = headers.get(TENANT_HEADER).ok_or_else(|| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "missing_tenant",
            format!("{TENANT_HEADER} header is required"),
        )
    })?;

    header
        .to_str()
        .ok()
        .and_then(|v| v.parse::<TenantId>().ok())
        .ok_or_else(|| {
            errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_tenant",
                format!("{TENANT_HEADER} must be a UUID"),
            )
        })
}
