//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use tether_agent::{
    AgentLauncher, CliAgentLauncher, ConversationGate, EventSink, TurnRunner,
};
use tether_store::ConversationStore;

use crate::config::ServerConfig;
use crate::ws::broadcast::{BroadcastManager, BroadcastSink};

/// Everything the handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Loaded server configuration.
    pub config: Arc<ServerConfig>,
    /// Conversation metadata and history.
    pub store: Arc<ConversationStore>,
    /// Per-conversation locks and active-turn slots.
    pub gate: Arc<ConversationGate>,
    /// Turn orchestrator.
    pub runner: Arc<TurnRunner>,
    /// WebSocket fan-out.
    pub broadcast: Arc<BroadcastManager>,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// Server start time for `/health` uptime.
    pub started_at: Instant,
}

impl AppState {
    /// Wire the production stack: CLI launcher + broadcast sink.
    #[must_use]
    pub fn new(config: ServerConfig, store: ConversationStore) -> Self {
        let launcher = Arc::new(CliAgentLauncher::new(Arc::new(config.agent.clone())));
        Self::with_launcher(config, store, launcher)
    }

    /// Wire with a custom launcher (tests substitute scripted agents).
    #[must_use]
    pub fn with_launcher(
        config: ServerConfig,
        store: ConversationStore,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(store);
        let settings = Arc::new(config.agent.clone());
        let gate = Arc::new(ConversationGate::new(settings.lock_timeout()));
        let broadcast = Arc::new(BroadcastManager::new());
        let sink: Arc<dyn EventSink> = Arc::new(BroadcastSink::new(Arc::clone(&broadcast)));
        let runner = Arc::new(TurnRunner::new(
            settings,
            Arc::clone(&gate),
            Arc::clone(&store),
            launcher,
            sink,
        ));
        Self {
            config,
            store,
            gate,
            runner,
            broadcast,
            metrics: crate::metrics::install_recorder(),
            started_at: Instant::now(),
        }
    }
}
