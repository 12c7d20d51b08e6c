//! Peer registry
//!
//! Owns every [`Peer`] record. Sessions refer to peers by id only.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::PeerIdFormat;
use crate::error::SignalingError;

/// Role a peer plays in sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerRole {
    Producer,
    Consumer,
    #[default]
    Unset,
}

impl PeerRole {
    /// Resolve the `roles` array of a `setPeerStatus` envelope.
    ///
    /// `producer` wins over `consumer`/`listener`; an empty list resets the
    /// role to unset.
    pub fn from_roles(roles: &[String]) -> Result<Self, SignalingError> {
        let mut role = PeerRole::Unset;
        for name in roles {
            match name.as_str() {
                "producer" => role = PeerRole::Producer,
                "consumer" | "listener" => {
                    if role != PeerRole::Producer {
                        role = PeerRole::Consumer;
                    }
                }
                other => {
                    return Err(SignalingError::validation(format!(
                        "unknown peer role `{}`",
                        other
                    )))
                }
            }
        }
        Ok(role)
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Producer => write!(f, "producer"),
            PeerRole::Consumer => write!(f, "consumer"),
            PeerRole::Unset => write!(f, "unset"),
        }
    }
}

/// Delivery target of a connected peer: the outbound queue drained by the
/// connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<String>,
    remote_addr: Option<SocketAddr>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn sender(&self) -> &mpsc::Sender<String> {
        &self.tx
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Writer side already dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A live connection
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub role: PeerRole,
    pub connection: ConnectionHandle,
    pub meta: Value,
    pub connected_at: DateTime<Utc>,
}

/// Mints fresh peer ids
#[derive(Debug)]
struct PeerIdGenerator {
    format: PeerIdFormat,
    next: u64,
}

impl PeerIdGenerator {
    fn new(format: PeerIdFormat) -> Self {
        Self { format, next: 1 }
    }

    fn next_id(&mut self) -> String {
        match self.format {
            PeerIdFormat::Sequential => {
                let id = self.next;
                self.next += 1;
                id.to_string()
            }
            PeerIdFormat::Uuid => uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Registry of live connections
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    ids: PeerIdGenerator,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(PeerIdFormat::default())
    }
}

impl PeerRegistry {
    pub fn new(id_format: PeerIdFormat) -> Self {
        Self {
            peers: HashMap::new(),
            ids: PeerIdGenerator::new(id_format),
        }
    }

    /// Register a connection under a fresh id with role `unset` and empty meta
    pub fn register(&mut self, connection: ConnectionHandle) -> Peer {
        let mut id = self.ids.next_id();
        while self.peers.contains_key(&id) {
            id = self.ids.next_id();
        }

        let peer = Peer {
            id: id.clone(),
            role: PeerRole::Unset,
            connection,
            meta: Value::Object(Default::default()),
            connected_at: Utc::now(),
        };
        self.peers.insert(id, peer.clone());

        debug!(peer_id = %peer.id, total = self.peers.len(), "Peer registered");
        peer
    }

    /// Update a peer's role and metadata in place
    pub fn set_role(&mut self, id: &str, role: PeerRole, meta: Value) -> Result<(), SignalingError> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| SignalingError::UnknownPeer(id.to_string()))?;
        peer.role = role;
        peer.meta = meta;
        debug!(peer_id = %id, role = %role, "Peer status updated");
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<&Peer, SignalingError> {
        self.peers
            .get(id)
            .ok_or_else(|| SignalingError::UnknownPeer(id.to_string()))
    }

    /// Remove a peer; unknown ids are a no-op.
    ///
    /// Session cleanup for the removed id is the caller's job; see
    /// [`crate::router::MessageRouter::disconnect`].
    pub fn remove(&mut self, id: &str) -> Option<Peer> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            debug!(peer_id = %id, total = self.peers.len(), "Peer removed");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Ids of every peer other than `id`
    pub fn ids_except(&self, id: &str) -> Vec<String> {
        self.peers.keys().filter(|k| k.as_str() != id).cloned().collect()
    }

    /// Ids of every registered peer
    pub fn ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle() -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(1);
        ConnectionHandle::new(tx)
    }

    #[test]
    fn test_register_assigns_sequential_ids() {
        let mut registry = PeerRegistry::default();
        let a = registry.register(handle());
        let b = registry.register(handle());

        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");
        assert_eq!(a.role, PeerRole::Unset);
        assert_eq!(a.meta, json!({}));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_uuid_ids() {
        let mut registry = PeerRegistry::new(PeerIdFormat::Uuid);
        let a = registry.register(handle());
        let b = registry.register(handle());

        assert_ne!(a.id, b.id);
        assert!(uuid::Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_set_role() {
        let mut registry = PeerRegistry::default();
        let peer = registry.register(handle());

        registry
            .set_role(&peer.id, PeerRole::Producer, json!({"name": "cam"}))
            .unwrap();
        let stored = registry.lookup(&peer.id).unwrap();
        assert_eq!(stored.role, PeerRole::Producer);
        assert_eq!(stored.meta, json!({"name": "cam"}));

        assert_eq!(
            registry.set_role("42", PeerRole::Consumer, Value::Null),
            Err(SignalingError::UnknownPeer("42".to_string()))
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = PeerRegistry::default();
        let peer = registry.register(handle());

        assert!(registry.remove(&peer.id).is_some());
        assert!(registry.remove(&peer.id).is_none());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.lookup(&peer.id),
            Err(SignalingError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_ids_are_not_reused_after_removal() {
        let mut registry = PeerRegistry::default();
        let a = registry.register(handle());
        registry.remove(&a.id);
        let b = registry.register(handle());
        assert_eq!(b.id, "2");
    }

    #[test]
    fn test_ids_except() {
        let mut registry = PeerRegistry::default();
        let a = registry.register(handle());
        let b = registry.register(handle());
        let c = registry.register(handle());

        let mut others = registry.ids_except(&a.id);
        others.sort();
        assert_eq!(others, vec![b.id, c.id]);
    }

    #[test]
    fn test_role_resolution() {
        let roles = |names: &[&str]| {
            PeerRole::from_roles(&names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        };

        assert_eq!(roles(&["producer"]), Ok(PeerRole::Producer));
        assert_eq!(roles(&["listener"]), Ok(PeerRole::Consumer));
        assert_eq!(roles(&["consumer", "producer"]), Ok(PeerRole::Producer));
        assert_eq!(roles(&[]), Ok(PeerRole::Unset));
        assert!(matches!(roles(&["admin"]), Err(SignalingError::Validation(_))));
    }

    #[test]
    fn test_connection_handle_closed() {
        let (tx, rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(tx);
        assert!(!handle.is_closed());
        drop(rx);
        assert!(handle.is_closed());
    }
}
