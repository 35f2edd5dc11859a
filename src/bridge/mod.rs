pub mod forwarding;
mod sse_http;
mod stdio_sse;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::service::{RoleClient, RunningService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::ServiceSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeTransportKind {
    StdioSse,
    SseHttp,
}

/// A running pairing of an MCP client (upstream) and MCP server
/// (downstream) translating between transports. Owns the upstream
/// connection and the downstream HTTP listener task.
pub struct Bridge {
    pub exposed_name: String,
    pub kind: BridgeTransportKind,
    /// Downstream mount path, e.g. "/my-service".
    pub path_prefix: String,
    upstream: Arc<RunningService<RoleClient, ()>>,
    shutdown: CancellationToken,
    server_task: JoinHandle<()>,
}

impl Bridge {
    pub async fn start(spec: &ServiceSpec, addr: SocketAddr, exposed_name: &str) -> Result<Bridge> {
        match spec.kind() {
            crate::types::ServiceKind::Stdio => stdio_sse::start(spec, addr, exposed_name).await,
            crate::types::ServiceKind::RemoteSse => sse_http::start(spec, addr, exposed_name).await,
        }
    }

    /// Relative path suffix a downstream client opens to receive events.
    pub fn sse_path(&self) -> String {
        match self.kind {
            BridgeTransportKind::StdioSse => format!("{}/sse", self.path_prefix),
            BridgeTransportKind::SseHttp => self.path_prefix.clone(),
        }
    }

    /// Relative path suffix a downstream client POSTs JSON-RPC envelopes to.
    pub fn message_path(&self) -> String {
        match self.kind {
            BridgeTransportKind::StdioSse => format!("{}/message", self.path_prefix),
            BridgeTransportKind::SseHttp => self.path_prefix.clone(),
        }
    }

    /// Whether the downstream HTTP listener task is still running. Used
    /// during the service warm-up race to detect an early crash.
    pub fn is_listener_alive(&self) -> bool {
        !self.server_task.is_finished()
    }

    /// Forward a lightweight liveness check to the upstream. rmcp's client
    /// peer has no dedicated ping call, so `list_tools` is used as the
    /// health probe, matching the teacher's connection health check.
    pub async fn ping(&self) -> Result<()> {
        self.upstream.peer().list_tools(Default::default()).await?;
        Ok(())
    }

    /// Shut down the HTTP listener with a bounded grace period, then close
    /// the upstream client.
    pub async fn close(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.server_task)
            .await
            .is_err()
        {
            tracing::warn!(service = %self.exposed_name, "bridge listener did not shut down within grace period");
        }

        if let Ok(upstream) = Arc::try_unwrap(self.upstream) {
            let _ = upstream.cancel().await;
        }
    }
}
