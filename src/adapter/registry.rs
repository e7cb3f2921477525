//! Connection registry - tracks every live SSH connection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use russh::server::Handle;
use russh::Disconnect;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Information about a live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub remote: SocketAddr,
    /// Principal, once authenticated
    pub user: Option<String>,
    pub connected_at: DateTime<Utc>,
}

struct ConnectionEntry {
    info: ConnectionInfo,
    /// Session handle, available once the handshake has started
    session: Option<Handle>,
}

/// Registry of live connections
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a freshly accepted connection and return its id
    pub fn register(&self, remote: SocketAddr) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = ConnectionEntry {
            info: ConnectionInfo {
                id: id.clone(),
                remote,
                user: None,
                connected_at: Utc::now(),
            },
            session: None,
        };

        self.connections.write().insert(id.clone(), entry);
        debug!("[adapter] connection registered: id={}, remote={}", id, remote);
        id
    }

    /// Attach the session handle used for forced disconnects
    pub fn attach(&self, id: &str, session: Handle) {
        if let Some(entry) = self.connections.write().get_mut(id) {
            entry.session = Some(session);
        }
    }

    /// Record the authenticated principal
    pub fn authenticated(&self, id: &str, user: &str) {
        if let Some(entry) = self.connections.write().get_mut(id) {
            entry.info.user = Some(user.to_string());
        }
    }

    /// Unregister a closed connection
    pub fn unregister(&self, id: &str) -> Option<ConnectionInfo> {
        let entry = self.connections.write().remove(id)?;
        debug!("[adapter] connection unregistered: id={}", id);
        Some(entry.info)
    }

    /// Look up a live connection by id
    pub(crate) fn get(&self, id: &str) -> Option<ConnectionInfo> {
        self.connections.read().get(id).map(|e| e.info.clone())
    }

    /// List all live connections
    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Get the number of live connections
    pub(crate) fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Disconnect every live connection
    pub fn disconnect_all(&self) {
        let sessions: Vec<(String, Handle)> = self
            .connections
            .read()
            .iter()
            .filter_map(|(id, e)| e.session.clone().map(|s| (id.clone(), s)))
            .collect();

        if sessions.is_empty() {
            return;
        }
        info!("[adapter] disconnecting {} connection(s)", sessions.len());

        for (id, session) in sessions {
            tokio::spawn(async move {
                if let Err(e) = session
                    .disconnect(
                        Disconnect::ByApplication,
                        "adapter terminated".to_string(),
                        "en".to_string(),
                    )
                    .await
                {
                    warn!("[adapter] failed to disconnect {}: {:?}", id, e);
                }
            });
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(addr());
        let b = registry.register(addr());
        assert_ne!(a, b);
        assert_eq!(registry.count(), 2);

        registry.authenticated(&a, "packer-ansible");
        assert_eq!(registry.get(&a).unwrap().user.as_deref(), Some("packer-ansible"));

        let info = registry.unregister(&a).unwrap();
        assert_eq!(info.remote, addr());
        assert!(registry.unregister(&a).is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all_without_sessions() {
        let registry = ConnectionRegistry::default();
        registry.register(addr());
        registry.disconnect_all();
        assert_eq!(registry.count(), 1);
    }
}
