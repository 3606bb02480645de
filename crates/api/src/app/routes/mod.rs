use axum::{routing::get, Router};

pub mod audit;
pub mod automation;
pub mod cards;
pub mod guardrails;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/cards", cards::router())
        .nest("/automation", automation::router())
        .nest("/guardrails", guardrails::router())
        .nest("/audit", audit::router())
}
