//! In-process connection registry
//!
//! The single owning map from charge-point id to live socket handle.
//! Connection teardown is removal from this map; the per-connection
//! writer task ends when its sender is dropped.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::ConnectionMeta;

/// What a connection's writer task can be asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Close { code: u16, reason: String },
}

/// One registered connection
#[derive(Clone)]
pub struct ConnectionHandle {
    pub meta: ConnectionMeta,
    sender: mpsc::UnboundedSender<OutboundMessage>,
}

impl ConnectionHandle {
    pub fn send(&self, message: OutboundMessage) -> Result<(), String> {
        self.sender
            .send(message)
            .map_err(|_| "connection writer gone".to_string())
    }
}

/// socket ↔ metadata map, keyed by charge-point id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A previous handle for the same charger (a
    /// raced reconnect) is replaced; its writer ends when dropped.
    pub fn register(&self, meta: ConnectionMeta, sender: mpsc::UnboundedSender<OutboundMessage>) {
        info!(
            charge_point_id = meta.charge_point_id.as_str(),
            connection_id = meta.connection_id.as_str(),
            "Session registered"
        );
        self.connections
            .insert(meta.charge_point_id.clone(), ConnectionHandle { meta, sender });
    }

    /// Remove a connection, but only if it is still the one registered
    /// under this `connection_id` (a newer socket must not be evicted by
    /// the old one's teardown).
    pub fn unregister(&self, charge_point_id: &str, connection_id: &str) -> bool {
        let removed = self
            .connections
            .remove_if(charge_point_id, |_, handle| {
                handle.meta.connection_id == connection_id
            })
            .is_some();
        if removed {
            info!(charge_point_id, connection_id, "Session unregistered");
        }
        removed
    }

    pub fn get(&self, charge_point_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(charge_point_id).map(|h| h.clone())
    }

    pub fn meta(&self, charge_point_id: &str) -> Option<ConnectionMeta> {
        self.connections.get(charge_point_id).map(|h| h.meta.clone())
    }

    pub fn send_text(&self, charge_point_id: &str, json: String) -> Result<(), String> {
        match self.connections.get(charge_point_id) {
            Some(handle) => handle.send(OutboundMessage::Text(json)),
            None => Err(format!("charge point not connected: {}", charge_point_id)),
        }
    }

    /// Ask a connection's writer to close the socket.
    pub fn close(&self, charge_point_id: &str, code: u16, reason: &str) -> bool {
        match self.connections.get(charge_point_id) {
            Some(handle) => handle
                .send(OutboundMessage::Close {
                    code,
                    reason: reason.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.connections.contains_key(charge_point_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
