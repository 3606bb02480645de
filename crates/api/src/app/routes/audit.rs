use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, routing::get, Json, Router};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/verify", get(verify_chain))
}

/// Verify the caller's tenant chain end to end.
pub async fn verify_chain(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.audit.verify_tenant(tenant.tenant_id()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::audit_error_to_response(e),
    }
}
