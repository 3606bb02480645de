use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use loopforge_core::CardId;
use loopforge_infra::{ScanRequest, TransitionRequest};
use loopforge_kanban::{Stage, TransitionMethod};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/:id/scan", post(scan_card))
        .route("/:id/transition", post(transition_card))
        .route("/:id/transitions", get(list_transitions))
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanCardRequest {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionCardRequest {
    pub to_stage: Stage,
    #[serde(default = "default_method")]
    pub method: TransitionMethod,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_method() -> TransitionMethod {
    TransitionMethod::Manual
}

fn parse_card_id(id: &str) -> Result<CardId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid card id"))
}

pub async fn scan_card(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    body: Option<Json<ScanCardRequest>>,
) -> axum::response::Response {
    let card_id = match parse_card_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let request = ScanRequest {
        card_id,
        tenant_id: Some(tenant.tenant_id()),
        actor: Some(principal.actor()),
        location: body.location,
        idempotency_key: body.idempotency_key.filter(|k| !k.trim().is_empty()),
    };

    match services.lifecycle.trigger_card_by_scan(request).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => errors::transition_error_to_response(e),
    }
}

pub async fn transition_card(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<TransitionCardRequest>,
) -> axum::response::Response {
    let card_id = match parse_card_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    let request = TransitionRequest {
        card_id,
        tenant_id: tenant.tenant_id(),
        to_stage: body.to_stage,
        user_id: Some(principal.user_id()),
        method: body.method,
        notes: body.notes,
        metadata: body.metadata.unwrap_or_else(|| serde_json::json!({})),
    };

    match services
        .lifecycle
        .authorized_transition(&principal.actor(), request)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::transition_error_to_response(e),
    }
}

pub async fn list_transitions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let card_id = match parse_card_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.lifecycle.history(tenant.tenant_id(), card_id).await {
        Ok(transitions) => Json(serde_json::json!({
            "card_id": card_id.to_string(),
            "transitions": transitions,
        }))
        .into_response(),
        Err(e) => errors::transition_error_to_response(e),
    }
}
