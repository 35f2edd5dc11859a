use std::pin::Pin;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::GatewayError;
use crate::types::ServiceStatus;
use crate::{resolve_workspace_id, AppState};

/// `ANY /{service}/*rest` — forward to the service's own bridge endpoint,
/// rewriting SSE `endpoint` events so subsequent client POSTs target the
/// gateway rather than the upstream directly.
pub async fn proxy(
    State(state): State<AppState>,
    Path((service, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let workspace_id = resolve_workspace_id(&headers, None, None);
    let workspace = state.workspaces.get_or_create(&workspace_id).await;
    let mcp_service = workspace
        .get_service(&service)
        .await
        .ok_or_else(|| GatewayError::not_found("service", &service))?;

    if mcp_service.status().await != ServiceStatus::Running {
        return Err(GatewayError::Unavailable(format!("service '{}' is not running", service)));
    }

    let sse_url = mcp_service.sse_url().await;
    let message_url = mcp_service.message_url().await;
    let base_url = mcp_service
        .base_url()
        .await
        .ok_or_else(|| GatewayError::Unavailable(format!("service '{}' has no base url", service)))?;

    let target = if rest == "sse" && sse_url.is_some() {
        sse_url.unwrap()
    } else if rest == "message" && message_url.is_some() {
        message_url.unwrap()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), rest)
    };

    let mut url = target;
    if let Some(query) = &query {
        url.push('?');
        url.push_str(query);
    }

    let client = reqwest::Client::new();
    let mut req = client.request(convert_method(&method), &url);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        req = req.header(name.as_str(), value.as_bytes());
    }
    req = req.body(body.to_vec());

    let upstream = req
        .send()
        .await
        .map_err(|e| GatewayError::Unavailable(format!("proxy to '{}' failed: {}", service, e)))?;

    let status = upstream.status();
    let is_sse = upstream
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        response_headers.insert(name.clone(), value.clone());
    }

    let status_code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    if is_sse {
        let rewritten = rewrite_endpoint_stream(upstream.bytes_stream(), service);
        let mut response = Response::new(Body::from_stream(rewritten));
        *response.status_mut() = status_code;
        *response.headers_mut() = response_headers;
        Ok(response)
    } else {
        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("reading proxy response failed: {}", e)))?;
        let mut response = bytes.into_response();
        *response.status_mut() = status_code;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn convert_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET)
}

/// Rewrites `event: endpoint` / `data: /message…` SSE frames so the data
/// payload points back at `/{service}/message…` instead of the upstream's
/// own bare path.
fn rewrite_endpoint_stream(
    upstream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    service: String,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    struct State {
        upstream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
        buffer: String,
        pending_endpoint: bool,
        service: String,
    }

    futures::stream::unfold(
        State {
            upstream: Box::pin(upstream),
            buffer: String::new(),
            pending_endpoint: false,
            service,
        },
        |mut state| async move {
            loop {
                if let Some(pos) = state.buffer.find('\n') {
                    let line: String = state.buffer.drain(..=pos).collect();
                    let trimmed = line.trim_end_matches(['\r', '\n']);

                    if trimmed == "event: endpoint" {
                        state.pending_endpoint = true;
                        return Some((Ok(Bytes::from(line)), state));
                    }

                    if state.pending_endpoint && trimmed.starts_with("data:") {
                        state.pending_endpoint = false;
                        let data = trimmed.trim_start_matches("data:").trim();
                        let out = if let Some(rest) = data.strip_prefix("/message") {
                            format!("data: /{}/message{}\n", state.service, rest)
                        } else {
                            line.clone()
                        };
                        return Some((Ok(Bytes::from(out)), state));
                    }

                    return Some((Ok(Bytes::from(line)), state));
                }

                match state.upstream.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(std::io::Error::other(e.to_string())), state));
                    }
                    None => {
                        if state.buffer.is_empty() {
                            return None;
                        }
                        let rest = std::mem::take(&mut state.buffer);
                        return Some((Ok(Bytes::from(rest)), state));
                    }
                }
            }
        },
    )
}
