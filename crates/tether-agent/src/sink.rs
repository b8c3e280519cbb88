//! Outbound event sink seam.

use tether_core::events::ServerEvent;

/// Where normalized events go.
///
/// Implemented by the server's broadcast fan-out; zero or more
/// subscribers may be listening. `send` must never block the turn —
/// drop-on-full is acceptable, stalling forever is not. Loss of every
/// subscriber does not affect turn execution.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn send(&self, event: &ServerEvent);
}

/// Sink that discards everything. Used when no transport is attached.
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _event: &ServerEvent) {}
}
