use std::future::Future;
use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    Implementation, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, PaginatedRequestParam, Prompt, ReadResourceRequestParam, ReadResourceResult,
    Resource, ResourceTemplate, ServerCapabilities, ServerInfo, SubscribeRequestParam, Tool,
    UnsubscribeRequestParam,
};
use rmcp::service::{RequestContext, RoleClient, RoleServer, RunningService};
use rmcp::{ErrorData as McpError, ServerHandler};

/// Snapshot of an upstream's capabilities taken once at bridge construction.
/// Handlers registered here never grow: an upstream that adds tools at
/// runtime keeps them invisible until the bridge is rebuilt (see design
/// note on snapshot-at-construction registration).
#[derive(Clone, Default)]
pub struct Snapshot {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
}

/// Forwards every MCP capability to a single upstream client. This is the
/// downstream-facing half of a Transport Bridge: tool/resource/prompt
/// listings are served from the construction-time `Snapshot`, while calls
/// (`call_tool`, `read_resource`, `get_prompt`) are always forwarded live.
#[derive(Clone)]
pub struct BridgeHandler {
    upstream: Arc<RunningService<RoleClient, ()>>,
    snapshot: Arc<Snapshot>,
    server_info: ServerInfo,
}

impl BridgeHandler {
    pub fn new(upstream: Arc<RunningService<RoleClient, ()>>, snapshot: Snapshot, exposed_name: &str) -> Self {
        let upstream_info = upstream.peer_info().cloned();
        let mut capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_resources()
            .enable_prompts()
            .build();
        if let Some(resources) = capabilities.resources.as_mut() {
            resources.subscribe = Some(true);
        }
        let server_info = ServerInfo {
            protocol_version: upstream_info
                .as_ref()
                .map(|i| i.protocol_version.clone())
                .unwrap_or_default(),
            capabilities,
            server_info: Implementation {
                name: format!("bridge:{}", exposed_name),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: upstream_info.and_then(|i| i.instructions),
        };

        Self {
            upstream,
            snapshot: Arc::new(snapshot),
            server_info,
        }
    }
}

impl ServerHandler for BridgeHandler {
    fn get_info(&self) -> ServerInfo {
        self.server_info.clone()
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move { Ok(ListToolsResult::with_all_items(self.snapshot.tools.clone())) }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            self.upstream
                .peer()
                .call_tool(request)
                .await
                .map_err(|e| McpError::internal_error(format!("upstream call_tool failed: {}", e), None))
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        async move {
            Ok(ListResourcesResult {
                resources: self.snapshot.resources.clone(),
                next_cursor: None,
            })
        }
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move {
            self.upstream
                .peer()
                .read_resource(request)
                .await
                .map_err(|e| McpError::internal_error(format!("upstream read_resource failed: {}", e), None))
        }
    }

    fn subscribe(
        &self,
        request: SubscribeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<(), McpError>> + Send + '_ {
        async move {
            self.upstream
                .peer()
                .subscribe(request)
                .await
                .map_err(|e| McpError::internal_error(format!("upstream subscribe failed: {}", e), None))
        }
    }

    fn unsubscribe(
        &self,
        request: UnsubscribeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<(), McpError>> + Send + '_ {
        async move {
            self.upstream
                .peer()
                .unsubscribe(request)
                .await
                .map_err(|e| McpError::internal_error(format!("upstream unsubscribe failed: {}", e), None))
        }
    }

    fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_ {
        async move {
            Ok(ListResourceTemplatesResult {
                resource_templates: self.snapshot.resource_templates.clone(),
                next_cursor: None,
            })
        }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        async move { Ok(ListPromptsResult::with_all_items(self.snapshot.prompts.clone())) }
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        async move {
            self.upstream
                .peer()
                .get_prompt(request)
                .await
                .map_err(|e| McpError::internal_error(format!("upstream get_prompt failed: {}", e), None))
        }
    }
}

/// Enumerate every capability on a freshly-connected upstream. Resource and
/// prompt listing failures are non-fatal (the upstream may simply not
/// support them); tool listing failure is recorded but also non-fatal.
pub async fn snapshot_upstream(upstream: &RunningService<RoleClient, ()>, exposed_name: &str) -> Snapshot {
    let tools = match upstream.peer().list_tools(Default::default()).await {
        Ok(result) => result.tools,
        Err(e) => {
            tracing::warn!(service = exposed_name, error = %e, "tools/list enumeration failed");
            Vec::new()
        }
    };

    let resources = match upstream.peer().list_resources(Default::default()).await {
        Ok(result) => result.resources,
        Err(e) => {
            tracing::debug!(service = exposed_name, error = %e, "resources/list enumeration failed, upstream may not support it");
            Vec::new()
        }
    };

    let resource_templates = match upstream.peer().list_resource_templates(Default::default()).await {
        Ok(result) => result.resource_templates,
        Err(e) => {
            tracing::debug!(service = exposed_name, error = %e, "resources/templates/list enumeration failed");
            Vec::new()
        }
    };

    let prompts = match upstream.peer().list_prompts(Default::default()).await {
        Ok(result) => result.prompts,
        Err(e) => {
            tracing::debug!(service = exposed_name, error = %e, "prompts/list enumeration failed");
            Vec::new()
        }
    };

    tracing::info!(
        service = exposed_name,
        tools = tools.len(),
        resources = resources.len(),
        resource_templates = resource_templates.len(),
        prompts = prompts.len(),
        "bridge snapshot taken"
    );

    Snapshot { tools, resources, resource_templates, prompts }
}
