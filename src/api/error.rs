// HTTP mapping of proxy errors to the OpenAI error envelope

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::proxy::error::ProxyError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: &'static str,
    code: &'static str,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "invalid_request_error", "not_found"),
            ApiError::Proxy(err) => match err {
                ProxyError::MalformedRequest(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_request_error", "malformed_request")
                }
                ProxyError::NoCredentialAvailable => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "api_error",
                    "no_credential_available",
                ),
                ProxyError::UpstreamFailure(_) => {
                    (StatusCode::BAD_GATEWAY, "api_error", "upstream_failure")
                }
                ProxyError::TranslationFailure(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "api_error",
                    "translation_failure",
                ),
                ProxyError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "api_error", "store_failure")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = self.parts();
        if status.is_server_error() {
            tracing::error!("Request failed with {}: {}", status.as_u16(), self);
        } else {
            tracing::debug!("Request rejected with {}: {}", status.as_u16(), self);
        }

        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                error_type,
                code,
            },
        };
        (status, Json(body)).into_response()
    }
}
