use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::port_allocator::PortAllocator;
use crate::service::McpService;
use crate::session_manager::SessionManager;
use crate::types::{AddOutcome, ServiceHealth, ServiceKind, ServiceSpec, ServiceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceStatus {
    Running,
    Stopped,
}

/// A snapshot of one `Running` service's advertised endpoints, handed to a
/// Session so it can subscribe without holding a reference to the Service
/// itself (see design note on cyclic references).
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub name: String,
    pub kind: ServiceKind,
    pub sse_url: String,
}

/// A namespace of MCP Services managed together, plus the Session Manager
/// for clients scoped to this workspace.
pub struct Workspace {
    pub id: String,
    status: RwLock<WorkspaceStatus>,
    services: RwLock<HashMap<String, Arc<McpService>>>,
    ports: Arc<PortAllocator>,
    default_retry_max: u32,
    pub sessions: SessionManager,
}

impl Workspace {
    pub fn new(
        id: String,
        ports: Arc<PortAllocator>,
        default_retry_max: u32,
        session_gc_interval_secs: u64,
        session_idle_timeout_secs: u64,
    ) -> Self {
        Self {
            id,
            status: RwLock::new(WorkspaceStatus::Running),
            services: RwLock::new(HashMap::new()),
            ports,
            default_retry_max,
            sessions: SessionManager::new(session_gc_interval_secs, session_idle_timeout_secs),
        }
    }

    /// Deploy, replace, or acknowledge-existing a service by name.
    pub async fn add_service(&self, spec: ServiceSpec) -> AddOutcome {
        if let Err(e) = spec.validate() {
            return AddOutcome::Failed { error: e };
        }

        let name = spec.name.clone();

        let existing = self.services.read().await.get(&name).cloned();
        if let Some(existing) = existing {
            if existing.status().await == ServiceStatus::Running {
                return AddOutcome::Existed;
            }

            // Stopped or Failed: atomically remove, then deploy fresh.
            self.services.write().await.remove(&name);
            let service = Arc::new(McpService::new(spec, self.ports.clone(), self.default_retry_max));
            match service.start().await {
                Ok(()) => {
                    self.services.write().await.insert(name, service);
                    return AddOutcome::Replaced;
                }
                Err(e) => {
                    return AddOutcome::Failed { error: format!("{:#}", e) };
                }
            }
        }

        let service = Arc::new(McpService::new(spec, self.ports.clone(), self.default_retry_max));
        match service.start().await {
            Ok(()) => {
                self.services.write().await.insert(name, service);
                AddOutcome::Deployed
            }
            Err(e) => AddOutcome::Failed { error: format!("{:#}", e) },
        }
    }

    pub async fn get_service(&self, name: &str) -> Option<Arc<McpService>> {
        self.services.read().await.get(name).cloned()
    }

    pub async fn list_services(&self) -> Vec<ServiceHealth> {
        let services = self.services.read().await;
        let mut healths = Vec::with_capacity(services.len());
        for service in services.values() {
            healths.push(service.health().await);
        }
        healths.sort_by(|a, b| a.name.cmp(&b.name));
        healths
    }

    pub async fn stop_service(&self, name: &str) -> bool {
        match self.get_service(name).await {
            Some(service) => {
                service.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn restart_service(&self, name: &str) -> Option<anyhow::Result<()>> {
        match self.get_service(name).await {
            Some(service) => Some(service.restart().await),
            None => None,
        }
    }

    pub async fn set_service_config(&self, name: &str, spec: ServiceSpec) -> Option<anyhow::Result<()>> {
        if let Some(service) = self.get_service(name).await {
            Some(service.set_config(spec).await)
        } else {
            None
        }
    }

    pub async fn remove_service(&self, name: &str) -> bool {
        let service = self.services.write().await.remove(name);
        match service {
            Some(service) => {
                service.stop().await;
                true
            }
            None => false,
        }
    }

    /// Endpoints of every currently-`Running` service, for a Session to
    /// subscribe against.
    pub async fn running_endpoints(&self) -> Vec<ServiceEndpoint> {
        let services = self.services.read().await;
        let mut endpoints = Vec::new();
        for service in services.values() {
            if service.status().await != ServiceStatus::Running {
                continue;
            }
            let Some(sse_url) = service.sse_url().await else {
                continue;
            };
            endpoints.push(ServiceEndpoint {
                name: service.name.clone(),
                kind: service.kind().await,
                sse_url,
            });
        }
        endpoints
    }

    /// Drains the service map by repeatedly snapshotting and removing one
    /// entry at a time outside the map lock, avoiding lock-recursion
    /// deadlocks with each service's own `Stop`.
    pub async fn close(&self) {
        loop {
            let next = {
                let services = self.services.read().await;
                services.keys().next().cloned()
            };
            let Some(name) = next else { break };
            if let Some(service) = self.services.write().await.remove(&name) {
                service.stop().await;
            }
        }
        self.sessions.close_all().await;
        *self.status.write().await = WorkspaceStatus::Stopped;
    }

    pub async fn status(&self) -> WorkspaceStatus {
        *self.status.read().await
    }
}
