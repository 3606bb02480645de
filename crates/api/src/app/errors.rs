use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use loopforge_core::ErrorClass;
use loopforge_infra::{AuditError, GuardrailError, TransitionError};

/// HTTP status for an error class.
pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::PreconditionFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Unauthorized => StatusCode::FORBIDDEN,
        ErrorClass::GuardrailViolation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::TransientInfrastructure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn class_error(class: ErrorClass, message: impl Into<String>) -> axum::response::Response {
    json_error(status_for(class), class.as_str(), message)
}

pub fn transition_error_to_response(err: TransitionError) -> axum::response::Response {
    let class = err.class();
    if class == ErrorClass::TransientInfrastructure {
        tracing::error!(error = %err, "lifecycle request failed");
    }
    class_error(class, err.to_string())
}

pub fn guardrail_error_to_response(err: GuardrailError) -> axum::response::Response {
    tracing::error!(error = %err, "guardrail check failed");
    class_error(err.class(), err.to_string())
}

pub fn audit_error_to_response(err: AuditError) -> axum::response::Response {
    tracing::error!(error = %err, "audit request failed");
    class_error(err.class(), err.to_string())
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

#[cfg(test)]
mod tests {
    use super::*;
    use loopforge_core::CardId;

    #[test]
    fn classes_map_to_statuses() {
        assert_eq!(status_for(ErrorClass::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorClass::PreconditionFailed), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorClass::Unauthorized), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorClass::GuardrailViolation), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorClass::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorClass::TransientInfrastructure),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn concurrent_transition_is_a_conflict() {
        let res = transition_error_to_response(TransitionError::ConcurrentTransition(CardId::new()));
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }
}
