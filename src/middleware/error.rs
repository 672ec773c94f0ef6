use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Authentication errors surfaced as HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No validated session reached the handler.
    #[error("not authenticated")]
    Unauthenticated,

    /// Session exists but no longer grants access.
    #[error("session expired")]
    SessionExpired,

    /// Deployment problem (missing credentials, bad key material). Fatal and
    /// alerting, never shown to the user in detail.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal failure.
    #[error("internal auth error: {0}")]
    Internal(String),
}

impl From<crate::error::Error> for AuthError {
    fn from(e: crate::error::Error) -> Self {
        match e {
            crate::error::Error::ConfigMissing(msg) => Self::Config(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated | Self::SessionExpired => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response(),
            Self::Config(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "auth internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}
