use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use stockledger_core::{TenantId, UserId};

use crate::app::errors::json_error;
use crate::context::{OperatorContext, TenantContext};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const OPERATOR_HEADER: &str = "x-operator-id";

/// Resolve tenant (required) and operator (optional) from request headers.
pub async fn tenant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let tenant_id: TenantId = required_header(req.headers(), TENANT_HEADER)?
        .parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_tenant", "X-Tenant-Id must be a UUID"))?;

    let operator_id = match optional_header(req.headers(), OPERATOR_HEADER)? {
        None => None,
        Some(raw) => Some(raw.parse::<UserId>().map_err(|_| {
            json_error(StatusCode::BAD_REQUEST, "invalid_operator", "X-Operator-Id must be a UUID")
        })?),
    };

    req.extensions_mut().insert(TenantContext::new(tenant_id));
    req.extensions_mut().insert(OperatorContext::new(operator_id));

    Ok(next.run(req).await)
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, Response> {
    optional_header(headers, name)?.ok_or_else(|| {
        json_error(StatusCode::UNAUTHORIZED, "missing_tenant", "X-Tenant-Id header is required")
    })
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, Response> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_header", format!("{name} is not valid text")))?
        .trim();
    Ok((!value.is_empty()).then_some(value))
}
