//! Error types for the orchestration core.

/// Errors from launching or reading an agent process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The agent binary could not be started.
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading the process output stream failed (includes oversized lines).
    #[error("failed to read agent output: {0}")]
    Read(String),

    /// A one-shot invocation exceeded its deadline.
    #[error("agent invocation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A one-shot invocation exited non-zero.
    #[error("agent exited with status {code:?}: {stderr}")]
    Exited {
        /// Process exit code, when one was reported.
        code: Option<i32>,
        /// Captured stderr (truncated).
        stderr: String,
    },
}

/// Errors from running a turn end to end.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// Process launch or stream read failure.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Conversation store failure.
    #[error(transparent)]
    Store(#[from] tether_store::StoreError),
}
