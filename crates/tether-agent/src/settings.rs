//! Agent invocation and policy knobs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-conversation tool allow-list.
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read", "Write", "Edit", "Bash", "Glob", "Grep", "WebSearch", "WebFetch",
];

/// Settings controlling agent process invocation and turn policy.
///
/// Lives inside the server config file; every field has a compiled
/// default so a minimal config stays minimal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentSettings {
    /// Agent CLI binary name or path.
    pub binary: String,

    /// Root directory for conversations without a configured working dir.
    pub workspace_root: PathBuf,

    /// Turn cap passed to the agent (`--max-turns`).
    pub max_turns: u32,

    /// Allow-list used when a conversation has no override.
    pub default_allowed_tools: Vec<String>,

    /// Wildcard tool patterns appended to every allow-list
    /// (e.g. `mcp__playwright__*` for externally configured tools).
    pub external_tool_patterns: Vec<String>,

    /// Tools whose completed input names an image file worth pushing
    /// to clients as an `image` event.
    pub screenshot_tools: Vec<String>,

    /// Substrings identifying a stale-resume failure in the agent's exit
    /// text. The agent's error wording is not a stable contract, so this
    /// is configuration rather than code.
    pub stale_resume_signatures: Vec<String>,

    /// System prompt appended to every turn describing the remote-client
    /// environment.
    pub system_prompt: String,

    /// How long a turn may wait for the conversation lock (ms).
    pub lock_timeout_ms: u64,

    /// Ceiling for a single stream-json line. Single lines can carry
    /// multi-megabyte embedded content (base64 image reads); undersizing
    /// this truncates events, it is not a performance knob.
    pub max_line_bytes: usize,

    /// Deadline for the detached title-generation invocation (ms).
    pub title_timeout_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: "claude".into(),
            workspace_root: PathBuf::from("."),
            max_turns: 200,
            default_allowed_tools: DEFAULT_ALLOWED_TOOLS
                .iter()
                .map(ToString::to_string)
                .collect(),
            external_tool_patterns: Vec::new(),
            screenshot_tools: vec!["mcp__playwright__browser_take_screenshot".into()],
            stale_resume_signatures: vec![
                "no conversation found with session id".into(),
                "session not found".into(),
            ],
            system_prompt: "The user is communicating with you remotely through Tether, \
                            a bridge server on their own machine. They cannot see your \
                            terminal or interact with files directly. Keep responses \
                            concise and focused on actionable results. Never start \
                            long-running foreground processes from the Bash tool; they \
                            will hang the conversation."
                .into(),
            lock_timeout_ms: 5_000,
            max_line_bytes: 32 * 1024 * 1024,
            title_timeout_ms: 30_000,
        }
    }
}

impl AgentSettings {
    /// Lock acquisition timeout as a [`Duration`].
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Title-generation deadline as a [`Duration`].
    #[must_use]
    pub fn title_timeout(&self) -> Duration {
        Duration::from_millis(self.title_timeout_ms)
    }

    /// Effective allow-list for a conversation: its override (or the
    /// default set) extended with the configured external patterns.
    #[must_use]
    pub fn effective_tools(&self, conversation_tools: Option<&[String]>) -> Vec<String> {
        let mut tools: Vec<String> =
            conversation_tools.map_or_else(|| self.default_allowed_tools.clone(), <[String]>::to_vec);
        for pattern in &self.external_tool_patterns {
            if !tools.contains(pattern) {
                tools.push(pattern.clone());
            }
        }
        tools
    }
}
