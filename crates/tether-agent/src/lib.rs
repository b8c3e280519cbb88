//! # tether-agent
//!
//! The orchestration core of the Tether bridge: everything between an
//! inbound `message` event and the stream of normalized events a client
//! sees.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `gate` | Per-conversation mutual exclusion + active-process slot |
//! | `launcher` | Spawns one agent CLI invocation per turn, bounded line reading |
//! | `normalize` | Raw stream-json lines → normalized [`ServerEvent`]s |
//! | `resume` | One-shot retry on stale resume tokens |
//! | `runner` | End-to-end turn state machine: persist, gate, stream, complete |
//! | `sink` | Outbound event sink seam (implemented by the server's broadcast) |
//! | `settings` | Agent invocation and policy knobs |
//! | `title` | Detached best-effort conversation auto-titling |
//!
//! ## Data Flow
//!
//! `runner` → `gate` (lock/slot) → `resume` → `launcher` → raw lines →
//! `normalize` → `sink` + store.
//!
//! [`ServerEvent`]: tether_core::events::ServerEvent

#![deny(unsafe_code)]

pub mod errors;
pub mod gate;
pub mod launcher;
pub mod normalize;
pub mod resume;
pub mod runner;
pub mod settings;
pub mod sink;
pub mod title;

#[cfg(test)]
pub(crate) mod testutil;

pub use errors::{LaunchError, TurnError};
pub use gate::{ConversationGate, GateError, TurnPermit};
pub use launcher::{AgentLauncher, CliAgentLauncher, LaunchedTurn, TurnExit, TurnRequest};
pub use normalize::{NormalizedTurn, Normalizer, TurnRecord};
pub use resume::{FinishedTurn, ResumeController, StaleResumePolicy, TurnOutcome};
pub use runner::{MessageRequest, TurnRunner};
pub use settings::AgentSettings;
pub use sink::{EventSink, NullSink};
