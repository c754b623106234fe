//! Live charger connection registry
//!
//! One logical connection per charger. A newer connection evicts the old
//! one (dropping its sender channel ends the old send task). Messages per
//! charger are strictly serialized through the per-connection channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// An active WebSocket connection to one charger.
#[derive(Debug)]
pub struct Connection {
    pub connection_id: u64,
    pub charger_id: String,
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Connection {
    fn new(connection_id: u64, charger_id: &str, sender: mpsc::UnboundedSender<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            charger_id: charger_id.to_string(),
            sender,
            connected_at: now,
            last_activity: now,
        }
    }
}

/// Outcome of a registration attempt.
pub enum RegisterResult {
    New { connection_id: u64 },
    Evicted { connection_id: u64 },
}

pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
    next_connection_id: AtomicU64,
}

pub type SharedConnectionRegistry = Arc<ConnectionRegistry>;

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn shared() -> SharedConnectionRegistry {
        Arc::new(Self::new())
    }

    /// Register a charger connection, evicting a stale one if present.
    pub fn register(
        &self,
        charger_id: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> RegisterResult {
        let evicted = self.connections.remove(charger_id).is_some();
        if evicted {
            warn!(charger_id, "Evicting stale connection, new one replaces it");
        }
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        info!(charger_id, connection_id, "Registering charger connection");
        self.connections
            .insert(charger_id.to_string(), Connection::new(connection_id, charger_id, sender));
        if evicted {
            RegisterResult::Evicted { connection_id }
        } else {
            RegisterResult::New { connection_id }
        }
    }

    /// Remove the connection, but only if `connection_id` still matches:
    /// an evicted connection's cleanup must not tear down its successor.
    pub fn unregister(&self, charger_id: &str, connection_id: u64) -> bool {
        self.connections
            .remove_if(charger_id, |_, conn| conn.connection_id == connection_id)
            .is_some()
    }

    pub fn send_to(&self, charger_id: &str, message: String) -> Result<(), String> {
        match self.connections.get(charger_id) {
            Some(conn) => conn
                .sender
                .send(message)
                .map_err(|e| format!("Failed to send message: {}", e)),
            None => Err(format!("Charger {} not connected", charger_id)),
        }
    }

    pub fn touch(&self, charger_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(charger_id) {
            conn.last_activity = Utc::now();
        }
    }

    /// Seconds since the last inbound traffic, `None` when not connected.
    pub fn silence_secs(&self, charger_id: &str) -> Option<i64> {
        self.connections
            .get(charger_id)
            .map(|conn| Utc::now().signed_duration_since(conn.last_activity).num_seconds())
    }

    pub fn is_connected(&self, charger_id: &str) -> bool {
        self.connections.contains_key(charger_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
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

    fn make_sender() -> mpsc::UnboundedSender<String> {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[test]
    fn register_and_send() {
        let reg = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(matches!(reg.register("CP-1", tx), RegisterResult::New { .. }));
        reg.send_to("CP-1", "hello".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn send_to_disconnected_fails() {
        let reg = ConnectionRegistry::new();
        assert!(reg.send_to("CP-9", "msg".into()).is_err());
    }

    #[test]
    fn second_register_evicts_first() {
        let reg = ConnectionRegistry::new();
        reg.register("CP-1", make_sender());
        assert!(matches!(
            reg.register("CP-1", make_sender()),
            RegisterResult::Evicted { .. }
        ));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn evicted_cleanup_does_not_remove_new_connection() {
        let reg = ConnectionRegistry::new();
        let old_id = match reg.register("CP-1", make_sender()) {
            RegisterResult::New { connection_id } => connection_id,
            _ => panic!("expected New"),
        };
        let new_id = match reg.register("CP-1", make_sender()) {
            RegisterResult::Evicted { connection_id } => connection_id,
            _ => panic!("expected Evicted"),
        };

        assert!(!reg.unregister("CP-1", old_id));
        assert!(reg.is_connected("CP-1"));
        assert!(reg.unregister("CP-1", new_id));
        assert!(!reg.is_connected("CP-1"));
    }

    #[test]
    fn silence_tracking() {
        let reg = ConnectionRegistry::new();
        reg.register("CP-1", make_sender());
        reg.touch("CP-1");
        assert!(reg.silence_secs("CP-1").unwrap() <= 1);
        assert!(reg.silence_secs("CP-9").is_none());
    }
}
