//! Error types for the dispatcher service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::registry::RegistryError;

/// Refusal returned when the toxicity gate blocks a request.
pub const TOXICITY_MESSAGE: &str = "This message contains toxic language and is not allowed.\nEsta mensagem contém linguagem tóxica e não é permitida.\nEste mensaje contiene lenguaje tóxico y no está permitido.";

/// Dispatcher error types
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("No LLMs were available to process the request")]
    NoEndpointAvailable,

    /// Terminal failure with failover disabled; carries the backend status
    /// when one was obtained.
    #[error("No LLMs were available to process the request. Won't try failover. Error message: {detail}")]
    NoFailover { status: u16, detail: String },

    #[error("Could not detect the request type. Try specifying type in the payload")]
    Classification,

    #[error("No LLMs were available to process the toxicity check")]
    ToxicityUnavailable,

    #[error("{TOXICITY_MESSAGE}")]
    ToxicBlocked,

    #[error("Fill in the middle is not supported by this LLM")]
    FimNotSupported,

    #[error("{0} doesn't support streaming")]
    StreamNotSupported(String),

    #[error("JSON load problem: {0}")]
    InvalidPayload(String),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::Registry(RegistryError::MissingRequiredField(_)) => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            DispatchError::Registry(RegistryError::Storage(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DispatchError::NoEndpointAvailable => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::NoFailover { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            DispatchError::Classification => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::ToxicityUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::ToxicBlocked => StatusCode::BAD_REQUEST,
            DispatchError::FimNotSupported => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::StreamNotSupported(_) => StatusCode::BAD_REQUEST,
            DispatchError::InvalidPayload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // The toxicity refusal is a plain-text product message, not an
        // error envelope.
        if matches!(self, DispatchError::ToxicBlocked) {
            return (status, TOXICITY_MESSAGE.to_string()).into_response();
        }

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let missing: DispatchError = RegistryError::MissingRequiredField("name").into();
        assert_eq!(missing.into_response().status(), StatusCode::BAD_REQUEST);

        let not_found: DispatchError = RegistryError::NotFound("endpoint 'x'".into()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        assert_eq!(
            DispatchError::ToxicBlocked.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchError::NoEndpointAvailable.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DispatchError::NoFailover {
                status: 503,
                detail: "connection refused".into()
            }
            .into_response()
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
