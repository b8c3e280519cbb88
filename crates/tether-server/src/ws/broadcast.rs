//! Event fan-out to connected WebSocket clients.
//!
//! Fan-out-capable by design: zero or more clients may be connected, and
//! turn execution is indifferent to the count. Two lossy policies protect
//! the transport from unbounded memory growth — both deliberate:
//!
//! - a hard per-event size ceiling (oversized events are dropped whole,
//!   never split or queued), and
//! - drop-on-full per client, with clients exceeding a lifetime drop
//!   threshold disconnected entirely.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use tracing::{debug, warn};

use tether_agent::EventSink;
use tether_core::events::ServerEvent;

use super::connection::ClientConnection;

/// Hard ceiling on one serialized outbound event.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Maximum lifetime drops before a slow client is disconnected.
const MAX_TOTAL_DROPS: u64 = 100;

/// Manages event broadcasting to connected clients.
pub struct BroadcastManager {
    /// Connected clients indexed by connection id.
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
    /// Connection count mirror (gauge updates without locking).
    active_count: AtomicUsize,
}

impl BroadcastManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
        }
    }

    /// Register an authenticated connection.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write();
        if conns.insert(connection.id.clone(), connection).is_none() {
            let count = self.active_count.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!("ws_connections_active").set(count as f64);
        }
    }

    /// Remove a connection by id.
    pub fn remove(&self, connection_id: &str) {
        let mut conns = self.connections.write();
        if conns.remove(connection_id).is_some() {
            let count = self.active_count.fetch_sub(1, Ordering::Relaxed) - 1;
            gauge!("ws_connections_active").set(count as f64);
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Serialize once, enforce the size ceiling, fan out to every
    /// client, and disconnect clients past the drop threshold.
    pub fn broadcast(&self, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
                return;
            }
        };
        if json.len() > MAX_EVENT_BYTES {
            counter!("ws_oversized_drops_total").increment(1);
            warn!(
                event_type = event.event_type(),
                bytes = json.len(),
                "dropping oversized outbound event"
            );
            return;
        }
        let payload = Arc::new(json);

        let mut to_remove = Vec::new();
        {
            let conns = self.connections.read();
            let mut recipients = 0u32;
            for conn in conns.values() {
                recipients += 1;
                if !conn.send(Arc::clone(&payload)) {
                    counter!("ws_broadcast_drops_total").increment(1);
                    let drops = conn.drop_count();
                    if drops >= MAX_TOTAL_DROPS {
                        warn!(conn_id = %conn.id, drops, "disconnecting slow client");
                        to_remove.push(conn.id.clone());
                    } else {
                        warn!(conn_id = %conn.id, total_drops = drops, "client channel full, event dropped");
                    }
                }
            }
            debug!(
                event_type = event.event_type(),
                recipients, "broadcast event"
            );
        }
        for id in &to_remove {
            self.remove(id);
        }
    }
}

impl Default for BroadcastManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The runner's [`EventSink`], backed by the broadcast manager.
pub struct BroadcastSink {
    manager: Arc<BroadcastManager>,
}

impl BroadcastSink {
    /// Wrap a manager.
    #[must_use]
    pub fn new(manager: Arc<BroadcastManager>) -> Self {
        Self { manager }
    }
}

impl EventSink for BroadcastSink {
    fn send(&self, event: &ServerEvent) {
        self.manager.broadcast(event);
    }
}
