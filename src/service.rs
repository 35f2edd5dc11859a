use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::bridge::Bridge;
use crate::port_allocator::PortAllocator;
use crate::types::{ServiceHealth, ServiceKind, ServiceSpec, ServiceStatus};

const BUILD_TIMEOUT: Duration = Duration::from_secs(300);
const WARMUP_TIMEOUT: Duration = Duration::from_secs(3);
const RESTART_BACKOFF: Duration = Duration::from_secs(5);

struct State {
    status: ServiceStatus,
    port: Option<u16>,
    bridge: Option<Bridge>,
    retry_count_remaining: u32,
    retry_max: u32,
    last_started_at: Option<DateTime<Utc>>,
    last_stopped_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    failure_reason: Option<String>,
}

/// Supervises one bridge: starting it on an allocated port, monitoring
/// liveness, restarting with bounded retries on failure, and guaranteeing
/// clean teardown of the child process / HTTP server it owns.
pub struct McpService {
    pub name: String,
    pub deployed_at: DateTime<Utc>,
    spec: RwLock<ServiceSpec>,
    state: RwLock<State>,
    ports: Arc<PortAllocator>,
}

impl McpService {
    pub fn new(spec: ServiceSpec, ports: Arc<PortAllocator>, default_retry_max: u32) -> Self {
        let retry_max = spec.retry_max.unwrap_or(default_retry_max);
        Self {
            name: spec.name.clone(),
            deployed_at: Utc::now(),
            spec: RwLock::new(spec),
            state: RwLock::new(State {
                status: ServiceStatus::Stopped,
                port: None,
                bridge: None,
                retry_count_remaining: retry_max,
                retry_max,
                last_started_at: None,
                last_stopped_at: None,
                last_error: None,
                failure_reason: None,
            }),
            ports,
        }
    }

    pub async fn status(&self) -> ServiceStatus {
        self.state.read().await.status
    }

    pub async fn kind(&self) -> ServiceKind {
        self.spec.read().await.kind()
    }

    pub async fn log_path(&self) -> Option<String> {
        self.spec.read().await.path.clone()
    }

    /// Only valid while `Stopped`.
    pub async fn set_config(&self, spec: ServiceSpec) -> Result<()> {
        let status = self.state.read().await.status;
        if status != ServiceStatus::Stopped {
            return Err(anyhow!("cannot set_config for '{}' while {:?}", self.name, status));
        }
        *self.spec.write().await = spec;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        {
            let state = self.state.read().await;
            if matches!(state.status, ServiceStatus::Running | ServiceStatus::Failed) {
                return Err(anyhow!("cannot start '{}' from state {:?}", self.name, state.status));
            }
        }

        let spec = self.spec.read().await.clone();

        if spec.kind() == ServiceKind::RemoteSse {
            let mut state = self.state.write().await;
            state.status = ServiceStatus::Running;
            state.last_started_at = Some(Utc::now());
            state.last_error = None;
            state.failure_reason = None;
            state.retry_count_remaining = state.retry_max;
            tracing::info!(service = %self.name, "remote-SSE service short-circuits to Running");
            return Ok(());
        }

        {
            let mut state = self.state.write().await;
            state.status = ServiceStatus::Starting;
            state.last_started_at = Some(Utc::now());
            state.last_error = None;
            state.failure_reason = None;
        }

        let port = {
            let mut state = self.state.write().await;
            let port = state.port.unwrap_or_else(|| self.ports.allocate());
            state.port = Some(port);
            port
        };

        if let Some(log_path) = &spec.path {
            if let Some(parent) = std::path::Path::new(log_path).parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!(service = %self.name, error = %e, "failed to create log directory");
                }
            }
        }

        let addr: SocketAddr = format!("127.0.0.1:{}", port)
            .parse()
            .expect("127.0.0.1:<u16> always parses");

        let build = tokio::time::timeout(BUILD_TIMEOUT, Bridge::start(&spec, addr, &self.name)).await;

        let bridge = match build {
            Ok(Ok(bridge)) => bridge,
            Ok(Err(e)) => {
                let reason = format!("bridge construction failed: {:#}", e);
                self.enter_failed(None, reason.clone()).await;
                return Err(anyhow!(reason));
            }
            Err(_) => {
                let reason = "bridge construction timed out".to_string();
                self.enter_failed(None, reason.clone()).await;
                return Err(anyhow!(reason));
            }
        };

        tokio::time::sleep(WARMUP_TIMEOUT).await;

        if !bridge.is_listener_alive() {
            let reason = "listener exited during warm-up".to_string();
            self.enter_failed(Some(bridge), reason.clone()).await;
            return Err(anyhow!(reason));
        }

        if let Err(e) = bridge.ping().await {
            let reason = format!("post-start ping failed: {:#}", e);
            self.enter_failed(Some(bridge), reason.clone()).await;
            return Err(anyhow!(reason));
        }

        let mut state = self.state.write().await;
        state.bridge = Some(bridge);
        state.status = ServiceStatus::Running;
        state.retry_count_remaining = state.retry_max;
        tracing::info!(service = %self.name, port, "service is Running");
        Ok(())
    }

    async fn enter_failed(&self, bridge: Option<Bridge>, reason: String) {
        if let Some(bridge) = bridge {
            bridge.close().await;
        }
        let mut state = self.state.write().await;
        if let Some(port) = state.port.take() {
            self.ports.release(port);
        }
        state.bridge = None;
        state.status = ServiceStatus::Failed;
        state.last_error = Some(reason.clone());
        state.failure_reason = Some(reason.clone());
        tracing::error!(service = %self.name, reason = %reason, "service entered Failed");
    }

    /// Idempotent. Remote-SSE services short-circuit this to a no-op —
    /// there is no bridge or child process to tear down.
    pub async fn stop(&self) {
        if self.spec.read().await.kind() == ServiceKind::RemoteSse {
            return;
        }

        let bridge = {
            let mut state = self.state.write().await;
            if state.status == ServiceStatus::Stopped {
                return;
            }
            state.status = ServiceStatus::Stopping;
            state.bridge.take()
        };

        if let Some(bridge) = bridge {
            bridge.close().await;
        }

        let mut state = self.state.write().await;
        if let Some(port) = state.port.take() {
            self.ports.release(port);
        }
        state.status = ServiceStatus::Stopped;
        state.last_stopped_at = Some(Utc::now());
        tracing::info!(service = %self.name, "service Stopped");
    }

    /// Remote-SSE services short-circuit this to a no-op (see design note
    /// on unsupported restart for remote services). Otherwise: exhausted
    /// retries transition straight to `Failed`; a failed restart attempt
    /// with retries remaining schedules another attempt after a 5s
    /// back-off.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        if self.spec.read().await.kind() == ServiceKind::RemoteSse {
            return Ok(());
        }

        let has_retries = {
            let mut state = self.state.write().await;
            if state.retry_count_remaining == 0 {
                state.status = ServiceStatus::Failed;
                state.failure_reason = Some("max retry count reached".to_string());
                false
            } else {
                state.retry_count_remaining -= 1;
                true
            }
        };

        if !has_retries {
            return Err(anyhow!("service '{}': max retry count reached", self.name));
        }

        self.stop().await;
        match self.start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let retries_left = self.state.read().await.retry_count_remaining;
                if retries_left > 0 {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(RESTART_BACKOFF).await;
                        let _ = this.restart().await;
                    });
                }
                Err(e)
            }
        }
    }

    pub async fn health(&self) -> ServiceHealth {
        let state = self.state.read().await;
        let spec = self.spec.read().await;

        let uptime_seconds = if state.status == ServiceStatus::Running {
            state
                .last_started_at
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
        } else {
            None
        };

        let (base_url, sse_url, message_url) = self.urls(&spec, &state);

        ServiceHealth {
            name: self.name.clone(),
            status: state.status,
            port: state.port,
            last_started_at: state.last_started_at.map(|t| t.to_rfc3339()),
            last_stopped_at: state.last_stopped_at.map(|t| t.to_rfc3339()),
            uptime_seconds,
            retry_count_remaining: state.retry_count_remaining,
            retry_max: state.retry_max,
            last_error: state.last_error.clone(),
            failure_reason: state.failure_reason.clone(),
            base_url,
            sse_url,
            message_url,
        }
    }

    /// Valid only while `Running`.
    fn urls(&self, spec: &ServiceSpec, state: &State) -> (Option<String>, Option<String>, Option<String>) {
        if state.status != ServiceStatus::Running {
            return (None, None, None);
        }

        let base = match &spec.url {
            Some(url) => url.clone(),
            None => format!("http://127.0.0.1:{}", state.port.unwrap_or_default()),
        };

        match &state.bridge {
            Some(bridge) => (
                Some(base.clone()),
                Some(format!("{}{}", base, bridge.sse_path())),
                Some(format!("{}{}", base, bridge.message_path())),
            ),
            // No bridge: this is a RemoteSse service short-circuited straight to
            // Running. `url` is already the complete legacy-SSE endpoint, not a
            // base to suffix — the POST-back endpoint is only learned once a
            // client opens the SSE stream and reads the `endpoint` event (see
            // `LegacySseWorker`), so there is no static message URL to report.
            None => (Some(base.clone()), Some(base), None),
        }
    }

    pub async fn sse_url(&self) -> Option<String> {
        let state = self.state.read().await;
        let spec = self.spec.read().await;
        self.urls(&spec, &state).1
    }

    pub async fn message_url(&self) -> Option<String> {
        let state = self.state.read().await;
        let spec = self.spec.read().await;
        self.urls(&spec, &state).2
    }

    pub async fn base_url(&self) -> Option<String> {
        let state = self.state.read().await;
        let spec = self.spec.read().await;
        self.urls(&spec, &state).0
    }

    /// POSTs a raw JSON-RPC envelope to the service's message URL.
    /// Intended for debug/test paths only.
    pub async fn send_message(&self, raw: serde_json::Value) -> Result<()> {
        let url = self
            .message_url()
            .await
            .ok_or_else(|| anyhow!("service '{}' is not running", self.name))?;

        let response = reqwest::Client::new().post(&url).json(&raw).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("POST {} returned {}", url, response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn remote_spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            workspace: None,
            url: Some("http://127.0.0.1:1/sse".to_string()),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            path: None,
            level: None,
            retry_max: Some(2),
        }
    }

    #[tokio::test]
    async fn remote_service_short_circuits_to_running() {
        let ports = Arc::new(PortAllocator::new(20000));
        let service = McpService::new(remote_spec("remote"), ports, 3);
        service.start().await.unwrap();
        assert_eq!(service.status().await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn remote_service_stop_is_noop() {
        let ports = Arc::new(PortAllocator::new(20010));
        let service = McpService::new(remote_spec("remote"), ports, 3);
        service.start().await.unwrap();
        service.stop().await;
        assert_eq!(service.status().await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn remote_service_restart_is_noop() {
        let ports = Arc::new(PortAllocator::new(20020));
        let service = Arc::new(McpService::new(remote_spec("remote"), ports, 3));
        service.start().await.unwrap();
        service.restart().await.unwrap();
        assert_eq!(service.status().await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn set_config_rejected_unless_stopped() {
        let ports = Arc::new(PortAllocator::new(20030));
        let service = McpService::new(remote_spec("remote"), ports, 3);
        service.start().await.unwrap();
        assert!(service.set_config(remote_spec("remote")).await.is_err());
    }
}
