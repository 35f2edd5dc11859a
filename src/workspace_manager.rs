use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::GatewayConfig;
use crate::port_allocator::PortAllocator;
use crate::workspace::Workspace;

const DEFAULT_WORKSPACE_ID: &str = "default";

/// Owns every Workspace by id, lazily creating them on first use. `""` and
/// a missing workspace header both resolve to `"default"`.
pub struct WorkspaceManager {
    workspaces: RwLock<HashMap<String, Arc<Workspace>>>,
    ports: Arc<PortAllocator>,
    config: GatewayConfig,
}

impl WorkspaceManager {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            ports: Arc::new(PortAllocator::new(config.base_port)),
            config,
        }
    }

    pub fn normalize_id(id: &str) -> String {
        if id.is_empty() {
            DEFAULT_WORKSPACE_ID.to_string()
        } else {
            id.to_string()
        }
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<Workspace> {
        let id = Self::normalize_id(id);

        if let Some(workspace) = self.workspaces.read().await.get(&id).cloned() {
            return workspace;
        }

        let mut workspaces = self.workspaces.write().await;
        if let Some(workspace) = workspaces.get(&id) {
            return workspace.clone();
        }

        let workspace = Arc::new(Workspace::new(
            id.clone(),
            self.ports.clone(),
            self.config.default_retry_max,
            self.config.session_gc_interval_secs,
            self.config.session_idle_timeout_secs,
        ));
        workspaces.insert(id, workspace.clone());
        workspace
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Workspace>> {
        let id = Self::normalize_id(id);
        self.workspaces.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Workspace>> {
        self.workspaces.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, id: &str) -> bool {
        let id = Self::normalize_id(id);
        let workspace = self.workspaces.write().await.remove(&id);
        match workspace {
            Some(workspace) => {
                workspace.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let workspaces = self.workspaces.write().await.drain().collect::<Vec<_>>();
        for (_, workspace) in workspaces {
            workspace.close().await;
        }
    }
}
