use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors that can surface from an HTTP handler.
///
/// Every handler converges on this type so the client always sees the
/// stable `{"error": "..."}` shape described in the gateway's error
/// handling design, regardless of which component raised the failure.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("service '{0}' is not running")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::warn!(%status, error = %self, "request failed");
        } else {
            tracing::error!(error = %self, "internal gateway error");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
