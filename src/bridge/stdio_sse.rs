use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::TokioChildProcess;
use rmcp::ServiceExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::forwarding::{snapshot_upstream, BridgeHandler};
use super::{Bridge, BridgeTransportKind};
use crate::types::ServiceSpec;

/// Build a stdio->SSE bridge: launch `spec.command` as a child process,
/// initialize it as an MCP client, snapshot its capabilities, and expose
/// them over SSE at `/{exposed_name}/sse` + `/{exposed_name}/message`.
pub async fn start(spec: &ServiceSpec, addr: SocketAddr, exposed_name: &str) -> Result<Bridge> {
    let command = spec
        .command
        .as_ref()
        .ok_or_else(|| anyhow!("stdio bridge requires a command"))?;

    let mut cmd = Command::new(command);
    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let transport = TokioChildProcess::new(cmd)
        .with_context(|| format!("failed to spawn '{}' for service '{}'", command, exposed_name))?;

    let upstream = Arc::new(
        ().serve(transport)
            .await
            .context("failed to initialize stdio MCP client")?,
    );

    let snapshot = snapshot_upstream(&upstream, exposed_name).await;
    let handler = BridgeHandler::new(upstream.clone(), snapshot, exposed_name);

    let shutdown = CancellationToken::new();
    let path_prefix = format!("/{}", exposed_name);
    let (sse_server, sse_router) = SseServer::new(SseServerConfig {
        bind: addr,
        sse_path: format!("{}/sse", path_prefix),
        post_path: format!("{}/message", path_prefix),
        ct: shutdown.clone(),
        sse_keep_alive: None,
    });
    let _server_ct = sse_server.with_service_directly(move || handler.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind stdio->SSE bridge for '{}' on {}", exposed_name, addr))?;

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, sse_router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
        {
            tracing::warn!(%error, "stdio->SSE bridge HTTP server stopped with error");
        }
    });

    Ok(Bridge {
        exposed_name: exposed_name.to_string(),
        kind: BridgeTransportKind::StdioSse,
        path_prefix,
        upstream,
        shutdown,
        server_task,
    })
}
