mod auth;
mod bridge;
mod config;
mod error;
mod port_allocator;
mod proxy_handler;
mod routes;
mod service;
mod session;
mod session_manager;
mod transport;
mod types;
mod workspace;
mod workspace_manager;

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use config::{ConfigManager, GatewayConfig};
use tokio::signal;
use workspace_manager::WorkspaceManager;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Process-wide state shared across every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<WorkspaceManager>,
    pub config: Arc<GatewayConfig>,
}

/// Workspace selection precedence: `X-Workspace-Id` header, then
/// `?workspaceId=`, then a path parameter, then `"default"`.
pub(crate) fn resolve_workspace_id(
    headers: &HeaderMap,
    query_workspace: Option<String>,
    path_workspace: Option<&str>,
) -> String {
    if let Some(header) = headers.get("X-Workspace-Id").and_then(|v| v.to_str().ok()) {
        if !header.is_empty() {
            return header.to_string();
        }
    }
    if let Some(id) = query_workspace {
        if !id.is_empty() {
            return id;
        }
    }
    if let Some(id) = path_workspace {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    "default".to_string()
}

/// Entry point: parse CLI flags, load the persisted service map, deploy it
/// into the default workspace, and serve the HTTP surface until SIGINT or
/// SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = GatewayConfig::parse_args(args).map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(bind = %config.bind_addr, config_dir = ?config.config_dir, "starting mcp-gateway");

    let workspaces = Arc::new(WorkspaceManager::new(config.clone()));

    let config_manager = ConfigManager::new(config.config_path());
    let services_file = config_manager.load()?;

    if !services_file.mcp_servers.is_empty() {
        let default_workspace = workspaces.get_or_create("default").await;
        for (name, mut spec) in services_file.mcp_servers {
            spec.name = name.clone();
            let workspace = match &spec.workspace {
                Some(id) if id != "default" => workspaces.get_or_create(id).await,
                _ => default_workspace.clone(),
            };
            let outcome = workspace.add_service(spec).await;
            tracing::info!(service = %name, outcome = ?outcome, "deployed service from config file");
        }
    }

    let state = AppState {
        workspaces: workspaces.clone(),
        config: Arc::new(config.clone()),
    };

    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, draining workspaces");
    match tokio::time::timeout(SHUTDOWN_DEADLINE, workspaces.close_all()).await {
        Ok(()) => tracing::info!("all workspaces drained"),
        Err(_) => tracing::warn!("shutdown deadline exceeded, exiting anyway"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
