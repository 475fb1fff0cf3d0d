//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store/bus/ledger wiring and the refresh task
//! - `routes/`: HTTP handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent JSON error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::config::ApiConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Starts the periodic stock refresh when configured, so this must run inside
/// a Tokio runtime.
pub async fn build_app(config: &ApiConfig) -> Result<Router, services::ServiceError> {
    let services = Arc::new(services::build_services(config).await?);

    if let Some(every) = config.refresh_interval {
        services::spawn_refresh_task(services.clone(), every);
    }

    Ok(router(services))
}

/// Router over already-built services.
pub fn router(services: Arc<services::AppServices>) -> Router {
    let tenant_scoped = routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(middleware::tenant_middleware))
            .layer(Extension(services)),
    );

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(tenant_scoped)
}
