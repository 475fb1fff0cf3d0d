use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};

use stockledger_core::MovementId;
use stockledger_infra::export;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{OperatorContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/movements", post(record_movement).get(list_movements))
        .route("/movements/export.csv", get(export_movements))
        .route("/movements/:id/reverse", post(reverse_movement))
        .route("/stock", get(list_stock))
        .route("/stock/export.csv", get(export_stock))
        .route("/locations/:location_id/available", get(available_batches))
}

pub async fn record_movement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<dto::RecordMovementRequest>,
) -> axum::response::Response {
    let candidate = body.into_candidate(operator.operator_id());

    match services.record_movement(tenant.tenant_id(), candidate).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn reverse_movement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ReverseMovementRequest>,
) -> axum::response::Response {
    let movement_id: MovementId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid movement id"),
    };

    match services
        .reverse_movement(
            tenant.tenant_id(),
            &body.location_id,
            &body.batch_id,
            movement_id,
            operator.operator_id(),
            body.reason,
        )
        .await
    {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_movements(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(params): Query<dto::HistoryParams>,
) -> axum::response::Response {
    match services.history(tenant.tenant_id(), &params.into_filter()).await {
        Ok(movements) => (StatusCode::OK, Json(movements)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(params): Query<dto::StockParams>,
) -> axum::response::Response {
    match services.stock(tenant.tenant_id(), &params.into_query()).await {
        Ok(rows) => (StatusCode::OK, Json(dto::StockResponse::from(rows))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn available_batches(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(location_id): Path<String>,
) -> axum::response::Response {
    match services.available_batches(tenant.tenant_id(), &location_id).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn export_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(params): Query<dto::StockParams>,
) -> axum::response::Response {
    let rows = match services.stock(tenant.tenant_id(), &params.into_query()).await {
        Ok(rows) => rows,
        Err(e) => return errors::dispatch_error_to_response(e),
    };
    match export::projection_csv_string(&rows) {
        Ok(body) => csv_response("stock.csv", body),
        Err(e) => errors::export_error_to_response(e),
    }
}

pub async fn export_movements(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(params): Query<dto::HistoryParams>,
) -> axum::response::Response {
    let movements = match services.history(tenant.tenant_id(), &params.into_filter()).await {
        Ok(m) => m,
        Err(e) => return errors::dispatch_error_to_response(e),
    };
    match export::movements_csv_string(&movements) {
        Ok(body) => csv_response("movements.csv", body),
        Err(e) => errors::export_error_to_response(e),
    }
}

fn csv_response(filename: &str, body: String) -> axum::response::Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}
