use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, routing::post, Json, Router};

use loopforge_automation::{OrderGuardrailInput, OutboundGuardrailInput};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/financial", post(check_financial))
        .route("/outbound", post(check_outbound))
}

/// Check an order against the caller's financial limits. Violations are a normal
/// (200) result; only counter-store failures are errors.
pub async fn check_financial(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<OrderGuardrailInput>,
) -> axum::response::Response {
    match services.guardrails.check_financial(tenant.tenant_id(), &body).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => errors::guardrail_error_to_response(e),
    }
}

pub async fn check_outbound(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<OutboundGuardrailInput>,
) -> axum::response::Response {
    match services.guardrails.check_outbound(tenant.tenant_id(), &body).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => errors::guardrail_error_to_response(e),
    }
}
