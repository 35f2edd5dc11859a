use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rmcp::model::CallToolRequestParam;
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::worker::WorkerTransport;
use rmcp::ServiceExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

use crate::transport::legacy_sse::LegacySseWorker;
use crate::workspace::ServiceEndpoint;

const PER_UPSTREAM_TOOLS_TIMEOUT: Duration = Duration::from_secs(15);
const AGGREGATE_TOOLS_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 100;
const SUBSCRIBE_RETRIES: u32 = 3;
const SUBSCRIBE_RETRY_BACKOFF: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub event: &'static str,
    pub data: String,
}

#[derive(Default)]
struct LastEmitted {
    client_id: Option<Value>,
    data: Option<String>,
}

struct UpstreamClient {
    service: Arc<RunningService<RoleClient, ()>>,
}

/// Fans one client's MCP conversation out to every MCP Service in its
/// workspace and fans their SSE responses back, rewriting ids and
/// prefixing tool names along the way.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    clients: RwLock<HashMap<String, UpstreamClient>>,
    init_results: RwLock<HashMap<String, Value>>,
    tools_by_service: RwLock<HashMap<String, Value>>,
    aggregated_tools: RwLock<Vec<Value>>,
    tools_ready: AtomicBool,
    channels: RwLock<Vec<mpsc::Sender<SessionEvent>>>,
    last_emitted: RwLock<LastEmitted>,
}

impl Session {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: RwLock::new(now),
            clients: RwLock::new(HashMap::new()),
            init_results: RwLock::new(HashMap::new()),
            tools_by_service: RwLock::new(HashMap::new()),
            aggregated_tools: RwLock::new(Vec::new()),
            tools_ready: AtomicBool::new(false),
            channels: RwLock::new(Vec::new()),
            last_emitted: RwLock::new(LastEmitted::default()),
        }
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity.read().await
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Utc::now();
    }

    /// Subscribe to every endpoint passed in (callers pass the workspace's
    /// currently-`Running` services only — a service isn't in that list at
    /// all until `Workspace::add_service` has already driven it to
    /// `Running`, so there is no "not yet started" case to retry here).
    /// What the retry loop actually covers is a transient dial failure
    /// against an endpoint that reports `Running`: a fresh TCP connect can
    /// still race the bridge's listener under load even past its own
    /// warm-up check. Endpoints still unreachable after the retry budget
    /// are skipped with a warning; the session remains usable with the
    /// rest.
    pub async fn subscribe_all(&self, endpoints: &[ServiceEndpoint]) {
        for endpoint in endpoints {
            let mut attempt = 0;
            let client = loop {
                attempt += 1;
                match connect_upstream(endpoint).await {
                    Ok(client) => break Some(client),
                    Err(e) => {
                        if attempt >= SUBSCRIBE_RETRIES {
                            tracing::warn!(service = %endpoint.name, error = %e, "giving up subscribing after retries");
                            break None;
                        }
                        tokio::time::sleep(SUBSCRIBE_RETRY_BACKOFF).await;
                    }
                }
            };

            let Some(client) = client else { continue };

            let init_result = client
                .peer_info()
                .and_then(|info| serde_json::to_value(info).ok())
                .unwrap_or(Value::Null);
            self.init_results.write().await.insert(endpoint.name.clone(), init_result);
            self.clients.write().await.insert(
                endpoint.name.clone(),
                UpstreamClient { service: Arc::new(client) },
            );
        }
    }

    pub async fn events(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.channels.write().await.push(tx);
        rx
    }

    /// Drops an event that repeats the last emitted one: same client id, or
    /// the identical serialized payload.
    async fn emit(&self, client_id: Option<Value>, payload: &Value) {
        let data = payload.to_string();

        {
            let last = self.last_emitted.read().await;
            let dup_client = client_id.is_some() && last.client_id == client_id;
            let dup_data = last.data.as_deref() == Some(data.as_str());
            if dup_client || dup_data {
                return;
            }
        }

        *self.last_emitted.write().await = LastEmitted {
            client_id,
            data: Some(data.clone()),
        };

        self.touch().await;

        let mut channels = self.channels.write().await;
        let mut dead = Vec::new();
        for (idx, tx) in channels.iter().enumerate() {
            let event = SessionEvent { event: "message", data: data.clone() };
            if tx.try_send(event).is_err() {
                tracing::warn!(session = %self.id, "event channel full or closed, dropping event");
                if tx.is_closed() {
                    dead.push(idx);
                }
            }
        }
        for idx in dead.into_iter().rev() {
            channels.remove(idx);
        }
    }

    /// Dispatch a raw JSON-RPC envelope from the client.
    pub async fn send_message(&self, raw: Value) -> Result<()> {
        self.touch().await;

        let method = raw
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing method"))?
            .to_string();
        let client_id = raw.get("id").cloned();
        let params = raw.get("params").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "tools/list" => self.aggregate_tools_list(client_id).await,
            "initialize" => self.respond_cached_initialize(client_id).await,
            "tools/call" => self.route_tool_call(client_id, params).await,
            "ping" | "logging/setLevel" => self.broadcast_empty_result(&method, client_id, params).await,
            other => self.broadcast(other, client_id, params).await,
        }

        Ok(())
    }

    async fn respond_cached_initialize(&self, client_id: Option<Value>) {
        let cached = self.init_results.read().await;
        let result = cached.values().next().cloned().unwrap_or(Value::Null);
        let envelope = json!({ "jsonrpc": "2.0", "id": client_id, "result": result });
        self.emit(client_id.clone(), &envelope).await;
    }

    async fn route_tool_call(&self, client_id: Option<Value>, params: Value) {
        let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
            self.emit_error(client_id, "tools/call missing name").await;
            return;
        };

        let Some((service, original_name)) = tool_name.split_once('_') else {
            self.emit_error(client_id, &format!("tool name '{}' is not service-prefixed", tool_name)).await;
            return;
        };

        let mut rewritten = params.clone();
        rewritten["name"] = Value::String(original_name.to_string());

        let clients = self.clients.read().await;
        let Some(client) = clients.get(service) else {
            self.emit_error(client_id, &format!("unknown service '{}'", service)).await;
            return;
        };

        match call_upstream(&client.service, "tools/call", rewritten, DEFAULT_CALL_TIMEOUT).await {
            Ok(result) => {
                let envelope = json!({ "jsonrpc": "2.0", "id": client_id, "result": result });
                drop(clients);
                self.emit(client_id.clone(), &envelope).await;
            }
            Err(e) => {
                drop(clients);
                self.emit_error(client_id, &e.to_string()).await;
            }
        }
    }

    async fn broadcast_empty_result(&self, method: &str, client_id: Option<Value>, params: Value) {
        let clients = self.clients.read().await;
        for client in clients.values() {
            let _ = call_upstream(&client.service, method, params.clone(), DEFAULT_CALL_TIMEOUT).await;
        }
        drop(clients);
        let envelope = json!({ "jsonrpc": "2.0", "id": client_id, "result": {} });
        self.emit(client_id, &envelope).await;
    }

    /// Broadcast any other method to all services; each upstream response
    /// is emitted as its own SSE event carrying the client's original id
    /// (clients must tolerate the resulting duplicate ids).
    async fn broadcast(&self, method: &str, client_id: Option<Value>, params: Value) {
        let service_names: Vec<String> = self.clients.read().await.keys().cloned().collect();

        for name in service_names {
            let clients = self.clients.read().await;
            let Some(client) = clients.get(&name) else { continue };
            let service = client.service.clone();
            drop(clients);

            match call_upstream(&service, method, params.clone(), DEFAULT_CALL_TIMEOUT).await {
                Ok(result) => {
                    let envelope = json!({ "jsonrpc": "2.0", "id": client_id, "result": result });
                    self.emit(client_id.clone(), &envelope).await;
                }
                Err(e) => {
                    tracing::warn!(service = %name, method, error = %e, "broadcast call failed");
                }
            }
        }
    }

    async fn emit_error(&self, client_id: Option<Value>, message: &str) {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": client_id,
            "error": { "code": -32000, "message": message }
        });
        self.emit(client_id, &envelope).await;
    }

    /// One client-visible `tools/list` fans out to every upstream but
    /// produces exactly one aggregated response.
    async fn aggregate_tools_list(&self, client_id: Option<Value>) {
        self.tools_ready.store(false, Ordering::SeqCst);
        self.tools_by_service.write().await.clear();
        self.aggregated_tools.write().await.clear();

        let services: Vec<(String, Arc<RunningService<RoleClient, ()>>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(name, c)| (name.clone(), c.service.clone()))
            .collect();

        if services.is_empty() {
            self.tools_ready.store(true, Ordering::SeqCst);
            let envelope = json!({ "jsonrpc": "2.0", "id": client_id, "result": { "tools": [] } });
            self.emit(client_id, &envelope).await;
            return;
        }

        let fetches = services.into_iter().map(|(name, service)| async move {
            let result = tokio::time::timeout(PER_UPSTREAM_TOOLS_TIMEOUT, service.peer().list_tools(Default::default())).await;
            let tools = match result {
                Ok(Ok(r)) => serde_json::to_value(r.tools).unwrap_or(Value::Array(Vec::new())),
                Ok(Err(e)) => {
                    tracing::warn!(service = %name, error = %e, "tools/list failed for upstream");
                    Value::Array(Vec::new())
                }
                Err(_) => {
                    tracing::warn!(service = %name, "tools/list timed out for upstream");
                    Value::Array(Vec::new())
                }
            };
            (name, tools)
        });

        let waited = tokio::time::timeout(AGGREGATE_TOOLS_TIMEOUT, futures::future::join_all(fetches)).await;

        let per_service = match waited {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(session = %self.id, "aggregated tools/list timed out overall");
                Vec::new()
            }
        };

        let mut aggregated = Vec::new();
        {
            let mut by_service = self.tools_by_service.write().await;
            for (name, tools) in per_service {
                if let Some(tools_arr) = tools.as_array() {
                    for tool in tools_arr {
                        let mut renamed = tool.clone();
                        if let Some(orig_name) = tool.get("name").and_then(Value::as_str) {
                            renamed["name"] = Value::String(format!("{}_{}", name, orig_name));
                        }
                        let desc = tool.get("description").and_then(Value::as_str).unwrap_or("");
                        renamed["description"] = Value::String(format!("[{}] {}", name, desc));
                        aggregated.push(renamed);
                    }
                }
                by_service.insert(name, tools);
            }
        }

        *self.aggregated_tools.write().await = aggregated.clone();
        self.tools_ready.store(true, Ordering::SeqCst);

        let envelope = json!({ "jsonrpc": "2.0", "id": client_id, "result": { "tools": aggregated } });
        self.emit(client_id, &envelope).await;
    }

    pub async fn close(&self) {
        let clients = self.clients.write().await.drain().collect::<Vec<_>>();
        for (_, client) in clients {
            if let Ok(service) = Arc::try_unwrap(client.service) {
                let _ = service.cancel().await;
            }
        }
        self.channels.write().await.clear();
    }
}

/// Every upstream kind, stdio-bridged or natively remote-SSE, is subscribed
/// the same way: a legacy-SSE client against the service's SSE URL, which
/// discovers its own POST-back endpoint from the stream's `endpoint` event.
async fn connect_upstream(endpoint: &ServiceEndpoint) -> Result<RunningService<RoleClient, ()>> {
    let worker = LegacySseWorker::from_url(&endpoint.sse_url)
        .map_err(|e| anyhow!("invalid sse url '{}': {}", endpoint.sse_url, e))?;
    let transport = WorkerTransport::spawn(worker);
    ().serve(transport).await.context("failed to initialize legacy SSE session client")
}

/// Execute a JSON-RPC method against one upstream client, returning the
/// `result` value. Mirrors the teacher's connection dispatch but bounded
/// by an explicit per-call deadline.
async fn call_upstream(
    service: &RunningService<RoleClient, ()>,
    method: &str,
    params: Value,
    deadline: Duration,
) -> Result<Value> {
    let call = async {
        let peer = service.peer();
        let result = match method {
            "ping" | "logging/setLevel" => {
                peer.list_tools(Default::default()).await.context("upstream health probe failed")?;
                json!({})
            }
            "tools/list" => serde_json::to_value(peer.list_tools(Default::default()).await.context("tools/list failed")?)?,
            "tools/call" => {
                let params: CallToolRequestParam = serde_json::from_value(params).context("invalid tools/call params")?;
                serde_json::to_value(peer.call_tool(params).await.context("tools/call failed")?)?
            }
            "resources/list" => {
                serde_json::to_value(peer.list_resources(Default::default()).await.context("resources/list failed")?)?
            }
            "resources/read" => {
                let params = serde_json::from_value(params).context("invalid resources/read params")?;
                serde_json::to_value(peer.read_resource(params).await.context("resources/read failed")?)?
            }
            "resources/templates/list" => serde_json::to_value(
                peer.list_resource_templates(Default::default()).await.context("resources/templates/list failed")?,
            )?,
            "prompts/list" => {
                serde_json::to_value(peer.list_prompts(Default::default()).await.context("prompts/list failed")?)?
            }
            "prompts/get" => {
                let params = serde_json::from_value(params).context("invalid prompts/get params")?;
                serde_json::to_value(peer.get_prompt(params).await.context("prompts/get failed")?)?
            }
            other => return Err(anyhow!("method not found: {}", other)),
        };
        Ok(result)
    };

    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| anyhow!("{} timed out after {:?}", method, deadline))?
}
