use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::GatewayError;
use crate::AppState;

/// Accepts the bearer token via `Authorization: Bearer <token>`, the
/// `api_key` query parameter, or the `sessionId` query parameter (the
/// latter two exist because browser `EventSource` cannot set headers).
pub async fn require_bearer_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = extract_token(&request);

    match token {
        Some(token) if token == state.config.bearer_token => Ok(next.run(request).await),
        _ => Err(GatewayError::Unauthorized),
    }
}

fn extract_token(request: &Request) -> Option<String> {
    if let Some(header) = request.headers().get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    let query = request.uri().query().unwrap_or("");
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        if key == "api_key" || key == "sessionId" {
            return Some(value.to_string());
        }
    }

    None
}
