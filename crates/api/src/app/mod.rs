//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, bus and engine wiring (in-memory or Postgres/Redis)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use loopforge_infra::AutomationConfig;

use crate::middleware;

pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, ServicesError};

/// Build the full HTTP router from configuration (public entrypoint used by `main.rs`).
pub async fn build_app(jwt_secret: String, config: &AutomationConfig) -> Result<Router, ServicesError> {
    let services = Arc::new(services::build_services(config).await?);
    Ok(build_app_with_services(jwt_secret, services))
}

/// Build the router around already-wired services.
pub fn build_app_with_services(jwt_secret: String, services: Arc<AppServices>) -> Router {
    let jwt = Arc::new(loopforge_auth::Hs256JwtValidator::new(jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require auth + tenant context.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
