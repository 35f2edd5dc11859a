use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declarative configuration for one MCP Service.
///
/// Exactly one of `url` or `command` must be set: `url` makes this a
/// remote-SSE service with no child process; `command` makes it a stdio
/// service that gets launched and bridged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<u32>,
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("service name cannot be empty".to_string());
        }
        match (&self.url, &self.command) {
            (Some(_), Some(_)) => {
                Err(format!("service '{}': exactly one of url/command, not both", self.name))
            }
            (None, None) => {
                Err(format!("service '{}': exactly one of url/command is required", self.name))
            }
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        if self.url.is_some() {
            ServiceKind::RemoteSse
        } else {
            ServiceKind::Stdio
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Launched as a child process, bridged stdio->SSE.
    Stdio,
    /// Already speaks SSE at a URL; re-exposed SSE->HTTP-stream.
    RemoteSse,
}

/// MCP Service runtime state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Outcome of `Workspace::add_service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AddOutcome {
    /// A `Running` service with this name already existed; spec ignored.
    Existed,
    /// No prior service; started from scratch.
    Deployed,
    /// A prior `Stopped`/`Failed` service was removed and replaced.
    Replaced,
    /// Start failed; nothing is registered under this name.
    Failed { error: String },
}

/// Health/introspection snapshot for one MCP Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stopped_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub retry_count_remaining: u32,
    pub retry_max: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_url: Option<String>,
}

/// A named mapping of service name -> spec, as persisted in `mcp_servers.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, ServiceSpec>,
}
