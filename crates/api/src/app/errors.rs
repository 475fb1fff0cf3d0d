use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use stockledger_infra::{DispatchError, ExportError, MovementStoreError};
use stockledger_ledger::LedgerError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Rejected(e) => ledger_error_to_response(e),
        DispatchError::Concurrency { message, .. } => json_error(StatusCode::CONFLICT, "conflict", message),
        DispatchError::TenantIsolation(msg) => json_error(StatusCode::FORBIDDEN, "tenant_isolation", msg),
        DispatchError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: MovementStoreError) -> axum::response::Response {
    match err {
        MovementStoreError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        MovementStoreError::TenantIsolation(msg) => json_error(StatusCode::FORBIDDEN, "tenant_isolation", msg),
        MovementStoreError::InvalidAppend(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
        MovementStoreError::Backend(msg) => {
            tracing::error!(error = %msg, "movement store unavailable");
            json_error(StatusCode::BAD_GATEWAY, "store_unavailable", msg)
        }
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        LedgerError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        LedgerError::InvalidQuantity(_) => json_error(StatusCode::BAD_REQUEST, "invalid_quantity", message),
        LedgerError::UnknownDirection(_) => json_error(StatusCode::BAD_REQUEST, "unknown_direction", message),
        LedgerError::BatchNotFound(_) => json_error(StatusCode::NOT_FOUND, "batch_not_found", message),
        LedgerError::MovementNotFound { .. } => json_error(StatusCode::NOT_FOUND, "movement_not_found", message),
        LedgerError::InsufficientStock {
            requested,
            available,
            ..
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": "insufficient_stock",
                "message": message,
                "requested": requested,
                "available": available,
                "shortfall": requested - available,
            })),
        )
            .into_response(),
        LedgerError::AlreadyReversed(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "already_reversed", message)
        }
        LedgerError::TenantMismatch => json_error(StatusCode::FORBIDDEN, "tenant_isolation", message),
    }
}

pub fn export_error_to_response(err: ExportError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "export_error", err.to_string())
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
