//! Connection registry: one named [`Connection`] per purpose (e.g. one per
//! pipeline run), sharing a single credential.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::builder::ConnectionConfig;
use crate::connection::Connection;

/// Caller-owned map of connections keyed by purpose.
///
/// Pass it to whatever needs realtime updates; there is no global instance.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
    token: RwLock<Option<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credential applied to connections created from now on.  Existing
    /// sockets keep the credential they were opened with.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Existing connection for `key`, or a new idle one built from `config`.
    ///
    /// On a hit `config` is ignored (first writer wins).  Never connects.
    pub fn get_or_create(&self, key: &str, config: ConnectionConfig) -> Connection {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(key) {
            return existing.clone();
        }

        let config = match self.token() {
            Some(token) => config.with_token(Some(token)),
            None => config,
        };
        let conn = Connection::new(key, config);
        connections.insert(key.to_string(), conn.clone());
        tracing::debug!(key = %key, "connection registered");
        conn
    }

    pub fn get(&self, key: &str) -> Option<Connection> {
        self.connections.lock().get(key).cloned()
    }

    /// Disconnect and evict `key`.  Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.connections.lock().remove(key);
        match removed {
            Some(conn) => {
                conn.disconnect();
                tracing::info!(key = %key, "connection removed");
                true
            }
            None => false,
        }
    }

    /// Disconnect and evict every connection.
    pub fn disconnect_all(&self) {
        let drained: Vec<Connection> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.disconnect();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "all connections removed");
        }
    }

    /// Keys of connections currently connected (sorted).
    pub fn list_connected(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .connections
            .lock()
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// All registered keys (sorted).
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connections.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ConnectionConfigBuilder;
    use crate::types::ConnectionState;

    fn cfg(url: &str) -> ConnectionConfig {
        ConnectionConfigBuilder::new().url(url).build().unwrap()
    }

    #[test]
    fn get_or_create_returns_same_instance() {
        let reg = ConnectionRegistry::new();
        let a = reg.get_or_create("p1", cfg("ws://localhost/ws"));
        let b = reg.get_or_create("p1", cfg("ws://elsewhere/ws"));
        assert!(a.ptr_eq(&b));
        // First writer wins.
        assert_eq!(b.config().url(), "ws://localhost/ws");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn created_connections_are_idle() {
        let reg = ConnectionRegistry::new();
        let conn = reg.get_or_create("p1", cfg("ws://localhost/ws"));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(reg.list_connected().is_empty());
    }

    #[test]
    fn remove_then_create_gives_new_instance() {
        let reg = ConnectionRegistry::new();
        let a = reg.get_or_create("p1", cfg("ws://localhost/ws"));
        assert!(reg.remove("p1"));
        assert!(!reg.remove("p1"));
        assert_eq!(a.state(), ConnectionState::Closed);

        let b = reg.get_or_create("p1", cfg("ws://localhost/ws"));
        assert!(!a.ptr_eq(&b));
        assert_eq!(b.state(), ConnectionState::Idle);
    }

    #[test]
    fn disconnect_all_closes_and_evicts() {
        let reg = ConnectionRegistry::new();
        let a = reg.get_or_create("p1", cfg("ws://localhost/ws"));
        let b = reg.get_or_create("p2", cfg("ws://localhost/ws"));
        assert_eq!(reg.keys(), vec!["p1", "p2"]);

        reg.disconnect_all();
        assert!(reg.is_empty());
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
    }

    #[test]
    fn token_applies_only_to_new_connections() {
        let reg = ConnectionRegistry::new();
        let before = reg.get_or_create("p1", cfg("ws://localhost/ws"));
        reg.set_token(Some("secret".into()));
        let after = reg.get_or_create("p2", cfg("ws://localhost/ws"));

        assert_eq!(before.config().token(), None);
        assert_eq!(after.config().token(), Some("secret"));
        assert_eq!(after.config().build_url(), "ws://localhost/ws?token=secret");
    }
}
