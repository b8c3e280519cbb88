//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{debug, info};

/// Build a Prometheus recorder and try to install it globally.
///
/// Returns the handle used to render `/metrics`. When another recorder
/// is already installed (test processes build several app states), the
/// returned handle simply renders empty output.
pub fn install_recorder() -> PrometheusHandle {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    match metrics::set_global_recorder(recorder) {
        Ok(()) => info!("prometheus metrics recorder installed"),
        Err(_) => debug!("metrics recorder already installed; rendering will be empty"),
    }
    handle
}

// Metric name constants to avoid typos across crates.

/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Broadcast drops from full client channels (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Events dropped for exceeding the size ceiling (counter).
pub const WS_OVERSIZED_DROPS_TOTAL: &str = "ws_oversized_drops_total";
/// Turns currently holding a conversation lock with a live process (gauge).
pub const AGENT_TURNS_ACTIVE: &str = "agent_turns_active";
/// Turns total (counter, labels: outcome).
pub const AGENT_TURNS_TOTAL: &str = "agent_turns_total";
/// Stale-resume recoveries (counter).
pub const AGENT_STALE_RESUME_RETRIES_TOTAL: &str = "agent_stale_resume_retries_total";
/// Malformed agent output lines skipped (counter).
pub const AGENT_MALFORMED_LINES_TOTAL: &str = "agent_malformed_lines_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n') || output.contains('#'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTIONS_TOTAL,
            WS_BROADCAST_DROPS_TOTAL,
            WS_OVERSIZED_DROPS_TOTAL,
            AGENT_TURNS_ACTIVE,
            AGENT_TURNS_TOTAL,
            AGENT_STALE_RESUME_RETRIES_TOTAL,
            AGENT_MALFORMED_LINES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
