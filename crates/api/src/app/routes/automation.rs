use axum::{extract::Extension, response::IntoResponse, routing::post, Json, Router};
use serde::Deserialize;

use loopforge_automation::{AutomationRule, evaluate_rules};

use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/evaluate", post(evaluate))
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub trigger_event: String,
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Dry-run rule evaluation. Pure: nothing is claimed, executed or audited.
pub async fn evaluate(
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<EvaluateRequest>,
) -> impl IntoResponse {
    let evaluation = evaluate_rules(&body.rules, &body.trigger_event, &body.context);
    tracing::debug!(
        tenant_id = %tenant.tenant_id(),
        trigger_event = %body.trigger_event,
        allowed = evaluation.allowed,
        "evaluated automation rules"
    );
    Json(evaluation)
}
