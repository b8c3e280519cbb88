//! Per-client connection handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use tether_core::events::ServerEvent;

/// Outbound channel capacity per connection. A client this far behind a
/// streaming turn is already dropping frames.
pub const OUTBOUND_BUFFER: usize = 256;

/// One authenticated WebSocket client.
///
/// Holds the send half of the connection's bounded outbound channel; the
/// socket writer task drains the other half. Sending never blocks — a
/// full channel counts a drop instead.
pub struct ClientConnection {
    /// Connection id (uuid), used as the registry key.
    pub id: String,
    tx: mpsc::Sender<Arc<String>>,
    drops: AtomicU64,
}

impl ClientConnection {
    /// Wrap a connection's outbound sender.
    #[must_use]
    pub fn new(id: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            drops: AtomicU64::new(0),
        }
    }

    /// Queue a serialized payload. Returns false (and counts a drop)
    /// when the channel is full or closed.
    pub fn send(&self, payload: Arc<String>) -> bool {
        if self.tx.try_send(payload).is_ok() {
            true
        } else {
            let _ = self.drops.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue one event (direct replies to this client).
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Lifetime count of dropped messages.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_counts_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ClientConnection::new("c".into(), tx);
        assert!(conn.send(Arc::new("one".into())));
        assert!(!conn.send(Arc::new("two".into())));
        assert_eq!(conn.drop_count(), 1);
        assert_eq!(rx.try_recv().unwrap().as_str(), "one");
    }

    #[test]
    fn send_event_serializes() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = ClientConnection::new("c".into(), tx);
        assert!(conn.send_event(&ServerEvent::AuthOk));
        let payload = rx.try_recv().unwrap();
        assert_eq!(payload.as_str(), r#"{"type":"auth_ok"}"#);
    }

    #[test]
    fn closed_channel_counts_drop() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let conn = ClientConnection::new("c".into(), tx);
        assert!(!conn.send(Arc::new("x".into())));
        assert_eq!(conn.drop_count(), 1);
    }
}
