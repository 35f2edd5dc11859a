use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{GatewayError, GatewayResult};
use crate::proxy_handler;
use crate::types::{AddOutcome, ServiceSpec};
use crate::{auth, resolve_workspace_id, AppState};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/deploy", post(deploy))
        .route("/delete", delete(delete_service))
        .route("/services", get(list_services))
        .route("/services/:name/health", get(service_health))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route("/api/workspaces/:id", delete(delete_workspace))
        .route("/api/workspaces/:id/services", get(list_workspace_services).post(add_workspace_service))
        .route("/api/workspaces/:ws/services/:name", put(set_service_spec).delete(remove_workspace_service))
        .route("/api/workspaces/:ws/services/:name/start", post(start_service))
        .route("/api/workspaces/:ws/services/:name/stop", post(stop_service))
        .route("/api/workspaces/:ws/services/:name/restart", post(restart_service))
        .route("/api/workspaces/:ws/services/:name/logs", get(service_logs))
        .route("/api/workspaces/:ws/sessions", get(list_sessions).post(create_session))
        .route("/api/workspaces/:ws/sessions/:id", delete(delete_session))
        .route("/api/sessions/:id/status", get(session_status))
        .route("/:service/*rest", axum::routing::any(proxy_handler::proxy))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer_token))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WorkspaceQuery {
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeployBody {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, ServiceSpec>,
}

async fn deploy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WorkspaceQuery>,
    Json(body): Json<DeployBody>,
) -> Response {
    let workspace_id = resolve_workspace_id(&headers, query.workspace_id, None);
    let workspace = state.workspaces.get_or_create(&workspace_id).await;

    let mut results = HashMap::new();
    let (mut deployed, mut existed, mut replaced, mut failed) = (0u32, 0u32, 0u32, 0u32);

    for (name, mut spec) in body.mcp_servers {
        spec.name = name.clone();
        let outcome = workspace.add_service(spec).await;
        match &outcome {
            AddOutcome::Deployed => deployed += 1,
            AddOutcome::Existed => existed += 1,
            AddOutcome::Replaced => replaced += 1,
            AddOutcome::Failed { .. } => failed += 1,
        }
        results.insert(name, outcome);
    }

    let total = deployed + existed + replaced + failed;
    let status = if failed > 0 { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
    let summary = json!({ "total": total, "deployed": deployed, "existed": existed, "replaced": replaced, "failed": failed });
    (status, Json(json!({ "results": results, "summary": summary }))).into_response()
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    name: String,
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
}

async fn delete_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeleteQuery>,
) -> GatewayResult<Json<Value>> {
    let workspace_id = resolve_workspace_id(&headers, query.workspace_id, None);
    let workspace = state.workspaces.get_or_create(&workspace_id).await;

    if workspace.remove_service(&query.name).await {
        Ok(Json(json!({ "removed": query.name })))
    } else {
        Err(GatewayError::not_found("service", query.name))
    }
}

async fn list_services(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WorkspaceQuery>,
) -> Json<Value> {
    let workspace_id = resolve_workspace_id(&headers, query.workspace_id, None);
    let workspace = state.workspaces.get_or_create(&workspace_id).await;
    Json(json!({ "services": workspace.list_services().await }))
}

async fn service_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WorkspaceQuery>,
    Path(name): Path<String>,
) -> GatewayResult<Json<Value>> {
    let workspace_id = resolve_workspace_id(&headers, query.workspace_id, None);
    let workspace = state.workspaces.get_or_create(&workspace_id).await;
    let service = workspace
        .get_service(&name)
        .await
        .ok_or_else(|| GatewayError::not_found("service", &name))?;
    Ok(Json(serde_json::to_value(service.health().await).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
}

/// `GET /sse` — without a `sessionId`, mint one and redirect; with one,
/// emit the `endpoint` event followed by the session's event stream.
async fn sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
) -> Response {
    let workspace_id = resolve_workspace_id(&headers, query.workspace_id.clone(), None);
    let workspace = state.workspaces.get_or_create(&workspace_id).await;

    let session_id = match query.session_id {
        Some(id) if !id.is_empty() => id,
        _ => {
            let session = workspace.sessions.create().await;
            let endpoints = workspace.running_endpoints().await;
            session.subscribe_all(&endpoints).await;
            return Redirect::to(&format!("/sse?sessionId={}", session.id)).into_response();
        }
    };

    let Some(session) = workspace.sessions.get(&session_id).await else {
        return GatewayError::not_found("session", session_id).into_response();
    };

    let rx = session.events().await;
    let endpoint_event = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={}", session_id));

    let stream = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(endpoint_event) })
        .chain(ReceiverStream::new(rx).map(|event| {
            Ok::<_, std::convert::Infallible>(Event::default().event(event.event).data(event.data))
        }));

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
}

async fn message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessageQuery>,
    Json(body): Json<Value>,
) -> GatewayResult<StatusCode> {
    let workspace_id = resolve_workspace_id(&headers, query.workspace_id, None);
    let workspace = state.workspaces.get_or_create(&workspace_id).await;
    let session = workspace
        .sessions
        .get(&query.session_id)
        .await
        .ok_or_else(|| GatewayError::not_found("session", &query.session_id))?;

    session.send_message(body).await.map_err(GatewayError::Internal)?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_workspaces(State(state): State<AppState>) -> Json<Value> {
    let ids: Vec<String> = state.workspaces.list().await.iter().map(|w| w.id.clone()).collect();
    Json(json!({ "workspaces": ids }))
}

#[derive(Debug, Deserialize)]
struct CreateWorkspaceBody {
    id: String,
}

async fn create_workspace(State(state): State<AppState>, Json(body): Json<CreateWorkspaceBody>) -> Json<Value> {
    let workspace = state.workspaces.get_or_create(&body.id).await;
    Json(json!({ "id": workspace.id }))
}

async fn delete_workspace(State(state): State<AppState>, Path(id): Path<String>) -> GatewayResult<Json<Value>> {
    if state.workspaces.remove(&id).await {
        Ok(Json(json!({ "removed": id })))
    } else {
        Err(GatewayError::not_found("workspace", id))
    }
}

async fn list_workspace_services(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let workspace = state.workspaces.get_or_create(&id).await;
    Json(json!({ "services": workspace.list_services().await }))
}

async fn add_workspace_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<ServiceSpec>,
) -> Json<Value> {
    let workspace = state.workspaces.get_or_create(&id).await;
    let outcome = workspace.add_service(spec).await;
    Json(serde_json::to_value(outcome).unwrap_or(Value::Null))
}

async fn set_service_spec(
    State(state): State<AppState>,
    Path((ws, name)): Path<(String, String)>,
    Json(mut spec): Json<ServiceSpec>,
) -> GatewayResult<Json<Value>> {
    spec.name = name.clone();
    let workspace = state.workspaces.get_or_create(&ws).await;
    match workspace.set_service_config(&name, spec).await {
        Some(Ok(())) => Ok(Json(json!({ "updated": name }))),
        Some(Err(e)) => Err(GatewayError::InvalidSpec(e.to_string())),
        None => Err(GatewayError::not_found("service", name)),
    }
}

async fn remove_workspace_service(
    State(state): State<AppState>,
    Path((ws, name)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    if workspace.remove_service(&name).await {
        Ok(Json(json!({ "removed": name })))
    } else {
        Err(GatewayError::not_found("service", name))
    }
}

async fn start_service(
    State(state): State<AppState>,
    Path((ws, name)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    let service = workspace.get_service(&name).await.ok_or_else(|| GatewayError::not_found("service", &name))?;
    service.start().await.map_err(GatewayError::Internal)?;
    Ok(Json(json!({ "started": name })))
}

async fn stop_service(
    State(state): State<AppState>,
    Path((ws, name)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    if workspace.stop_service(&name).await {
        Ok(Json(json!({ "stopped": name })))
    } else {
        Err(GatewayError::not_found("service", name))
    }
}

async fn restart_service(
    State(state): State<AppState>,
    Path((ws, name)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    match workspace.restart_service(&name).await {
        Some(Ok(())) => Ok(Json(json!({ "restarted": name }))),
        Some(Err(e)) => Err(GatewayError::Internal(e)),
        None => Err(GatewayError::not_found("service", name)),
    }
}

async fn service_logs(
    State(state): State<AppState>,
    Path((ws, name)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    let service = workspace.get_service(&name).await.ok_or_else(|| GatewayError::not_found("service", &name))?;
    let contents = match service.log_path().await {
        Some(path) => std::fs::read_to_string(&path).unwrap_or_default(),
        None => String::new(),
    };
    Ok(Json(json!({ "logs": contents })))
}

async fn list_sessions(State(state): State<AppState>, Path(ws): Path<String>) -> Json<Value> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    let ids: Vec<String> = workspace.sessions.list().await.iter().map(|s| s.id.clone()).collect();
    Json(json!({ "sessions": ids }))
}

async fn create_session(State(state): State<AppState>, Path(ws): Path<String>) -> Json<Value> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    let session = workspace.sessions.create().await;
    let endpoints = workspace.running_endpoints().await;
    session.subscribe_all(&endpoints).await;
    Json(json!({ "id": session.id }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path((ws, id)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    let workspace = state.workspaces.get_or_create(&ws).await;
    if workspace.sessions.close(&id).await {
        Ok(Json(json!({ "closed": id })))
    } else {
        Err(GatewayError::not_found("session", id))
    }
}

async fn session_status(State(state): State<AppState>, Path(id): Path<String>) -> GatewayResult<Json<Value>> {
    for workspace in state.workspaces.list().await {
        if let Some(session) = workspace.sessions.get(&id).await {
            return Ok(Json(json!({
                "id": session.id,
                "createdAt": session.created_at.to_rfc3339(),
                "lastActivityAt": session.last_activity_at().await.to_rfc3339(),
            })));
        }
    }
    Err(GatewayError::not_found("session", id))
}
