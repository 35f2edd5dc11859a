use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::tower::StreamableHttpService;
use rmcp::transport::worker::WorkerTransport;
use rmcp::transport::StreamableHttpServerConfig;
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;

use super::forwarding::{snapshot_upstream, BridgeHandler};
use super::{Bridge, BridgeTransportKind};
use crate::transport::legacy_sse::LegacySseWorker;
use crate::types::ServiceSpec;

/// Build an SSE->HTTP-stream bridge: connect to `spec.url` as a legacy SSE
/// MCP client, snapshot its capabilities, and re-expose them as a
/// streamable-HTTP MCP server mounted at `/{exposed_name}`.
pub async fn start(spec: &ServiceSpec, addr: SocketAddr, exposed_name: &str) -> Result<Bridge> {
    let url = spec
        .url
        .as_ref()
        .ok_or_else(|| anyhow!("SSE->HTTP-stream bridge requires a url"))?;

    let worker = LegacySseWorker::from_url(url).map_err(|e| anyhow!("invalid SSE url '{}': {}", url, e))?;
    let transport = WorkerTransport::spawn(worker);

    let upstream = Arc::new(
        ().serve(transport)
            .await
            .context("failed to initialize legacy SSE MCP client")?,
    );

    let snapshot = snapshot_upstream(&upstream, exposed_name).await;
    let handler = BridgeHandler::new(upstream.clone(), snapshot, exposed_name);

    let shutdown = CancellationToken::new();
    let path_prefix = format!("/{}", exposed_name);

    let service: StreamableHttpService<BridgeHandler, LocalSessionManager> = StreamableHttpService::new(
        move || Ok(handler.clone()),
        Default::default(),
        StreamableHttpServerConfig {
            stateful_mode: true,
            sse_keep_alive: None,
            cancellation_token: shutdown.child_token(),
        },
    );

    let router = axum::Router::new().nest_service(&path_prefix, service);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind SSE->HTTP-stream bridge for '{}' on {}", exposed_name, addr))?;

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
        {
            tracing::warn!(%error, "SSE->HTTP-stream bridge HTTP server stopped with error");
        }
    });

    Ok(Bridge {
        exposed_name: exposed_name.to_string(),
        kind: BridgeTransportKind::SseHttp,
        path_prefix,
        upstream,
        shutdown,
        server_task,
    })
}
