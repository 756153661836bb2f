use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use factorops_infra::ServiceError;

/// Maps service failures onto HTTP statuses. Validation errors carry the offending field.
pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Validation { field, message } => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": "validation_error",
                "field": field,
                "message": message,
            })),
        )
            .into_response(),
        ServiceError::StateConflict(msg) => json_error(StatusCode::CONFLICT, "state_conflict", msg),
        ServiceError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        ServiceError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        ServiceError::LedgerWriteFailure(msg) => {
            json_error(StatusCode::BAD_GATEWAY, "ledger_write_failure", msg)
        }
        ServiceError::Infrastructure(msg) => {
            tracing::warn!(error = %msg, "request failed on infrastructure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "infrastructure_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path id, answering 400 with the id's name on failure.
pub fn parse_id<T>(raw: &str, what: &'static str) -> Result<T, axum::response::Response>
where
    T: core::str::FromStr,
{
    raw.parse::<T>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what}")))
}
