use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::Session;

struct Inner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout_secs: u64,
}

/// Owns every Session scoped to one Workspace, plus a background sweep
/// that evicts sessions idle longer than `idle_timeout_secs`.
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(gc_interval_secs: u64, idle_timeout_secs: u64) -> Self {
        let inner = Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout_secs,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(gc_interval_secs.max(1)));
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                sweep_idle(&inner).await;
            }
        });

        Self { inner }
    }

    pub async fn create(&self) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        self.inner.sessions.write().await.insert(id, session.clone());
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().await.values().cloned().collect()
    }

    pub async fn close(&self, id: &str) -> bool {
        let session = self.inner.sessions.write().await.remove(id);
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let sessions = self.inner.sessions.write().await.drain().collect::<Vec<_>>();
        for (_, session) in sessions {
            session.close().await;
        }
    }
}

async fn sweep_idle(inner: &Inner) {
    let idle_timeout = chrono::Duration::seconds(inner.idle_timeout_secs as i64);
    let now = Utc::now();

    let stale: Vec<String> = {
        let sessions = inner.sessions.read().await;
        let mut stale = Vec::new();
        for (id, session) in sessions.iter() {
            if now - session.last_activity_at().await > idle_timeout {
                stale.push(id.clone());
            }
        }
        stale
    };

    for id in stale {
        let session = inner.sessions.write().await.remove(&id);
        if let Some(session) = session {
            tracing::info!(session = %id, "evicting idle session");
            session.close().await;
        }
    }
}
