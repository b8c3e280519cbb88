//! Agent process launching and supervision.
//!
//! One agent CLI invocation per turn. Stdout is exposed as a lazy stream
//! of raw lines with a bounded-but-large line codec; stderr is captured
//! for exit diagnostics. The stream is finite and not restartable — a new
//! turn always launches a new process.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use tether_core::ids::ConversationId;

use crate::errors::LaunchError;
use crate::settings::AgentSettings;

/// Cap on captured stderr; exit diagnostics never need more.
const STDERR_CAP: u64 = 64 * 1024;

/// Everything needed to run one agent invocation. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnRequest {
    /// The conversation this turn belongs to.
    pub conversation_id: ConversationId,
    /// Full prompt text (image pointers already prepended).
    pub prompt: String,
    /// Resume token; `--resume` is only passed when present.
    pub resume_token: Option<String>,
    /// Working directory for the process.
    pub working_dir: std::path::PathBuf,
    /// Tool allow-list specs.
    pub allowed_tools: Vec<String>,
    /// Turn cap.
    pub max_turns: u32,
}

/// How an agent process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnExit {
    /// Exit status zero; full output captured.
    Clean {
        /// Captured stderr (often empty).
        stderr: String,
    },
    /// Non-zero exit.
    Failed {
        /// Exit code, when the OS reported one.
        code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },
    /// Killed by cancellation/supersession.
    Terminated,
}

impl TurnExit {
    /// Exit text inspected by the stale-resume predicate.
    #[must_use]
    pub fn stderr(&self) -> &str {
        match self {
            Self::Clean { stderr } | Self::Failed { stderr, .. } => stderr,
            Self::Terminated => "",
        }
    }
}

/// Lazy stream of raw output lines.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, LaunchError>> + Send>>;

/// Control half of a launched process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Request termination. Best-effort and idempotent; readers observe
    /// end-of-stream shortly after.
    async fn terminate(&self);

    /// Wait for exit and classify it. Consumes the child; later calls
    /// report [`TurnExit::Terminated`].
    async fn finish(&self) -> TurnExit;
}

/// A running agent invocation: its output lines plus process control.
pub struct LaunchedTurn {
    /// Raw stdout lines; finite, ends at process exit.
    pub lines: LineStream,
    /// Termination and exit classification.
    pub control: Arc<dyn ProcessControl>,
}

impl std::fmt::Debug for LaunchedTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedTurn").finish_non_exhaustive()
    }
}

/// Seam for launching agent processes (mocked in tests).
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start one streaming turn invocation.
    async fn launch(&self, request: &TurnRequest) -> Result<LaunchedTurn, LaunchError>;

    /// Run a short non-streaming invocation (title generation), returning
    /// trimmed stdout.
    async fn oneshot(&self, prompt: &str, timeout: Duration) -> Result<String, LaunchError>;
}

/// Production launcher wrapping `tokio::process::Command`.
pub struct CliAgentLauncher {
    settings: Arc<AgentSettings>,
}

impl CliAgentLauncher {
    /// Create a launcher with the given settings.
    #[must_use]
    pub fn new(settings: Arc<AgentSettings>) -> Self {
        Self { settings }
    }

    /// Argument vector for a streaming turn (separated out for tests).
    #[must_use]
    pub fn turn_args(&self, request: &TurnRequest) -> Vec<String> {
        let tools = request.allowed_tools.join(",");
        let mut args = vec![
            "-p".to_owned(),
            request.prompt.clone(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
            "--max-turns".to_owned(),
            request.max_turns.to_string(),
            "--tools".to_owned(),
            tools.clone(),
            "--allowedTools".to_owned(),
            tools,
        ];
        if !self.settings.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_owned());
            args.push(self.settings.system_prompt.clone());
        }
        if let Some(token) = &request.resume_token {
            args.push("--resume".to_owned());
            args.push(token.clone());
        }
        args
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        // The agent refuses to run when it believes it is nested inside
        // itself; this marker leaks in when the server is started from an
        // agent shell.
        let _ = cmd
            .env_remove("CLAUDECODE")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentLauncher for CliAgentLauncher {
    async fn launch(&self, request: &TurnRequest) -> Result<LaunchedTurn, LaunchError> {
        let mut cmd = self.base_command();
        let _ = cmd
            .args(self.turn_args(request))
            .current_dir(&request.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            conversation_id = %request.conversation_id,
            binary = %self.settings.binary,
            resume = request.resume_token.is_some(),
            working_dir = %request.working_dir.display(),
            "launching agent process"
        );

        let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Read("stdout not captured".into()))?;
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr {
                let _ = pipe.take(STDERR_CAP).read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(self.settings.max_line_bytes))
            .map(|item| item.map_err(|e| LaunchError::Read(e.to_string())));

        Ok(LaunchedTurn {
            lines: Box::pin(lines),
            control: Arc::new(CliProcessControl {
                child: tokio::sync::Mutex::new(Some(child)),
                stderr_task: tokio::sync::Mutex::new(Some(stderr_task)),
                terminated: AtomicBool::new(false),
            }),
        })
    }

    async fn oneshot(&self, prompt: &str, timeout: Duration) -> Result<String, LaunchError> {
        let mut cmd = self.base_command();
        let _ = cmd
            .args([
                "-p",
                prompt,
                "--output-format",
                "text",
                "--max-turns",
                "0",
            ])
            .current_dir(std::env::temp_dir())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, async {
            cmd.spawn().map_err(LaunchError::Spawn)?
                .wait_with_output()
                .await
                .map_err(|e| LaunchError::Read(e.to_string()))
        })
        .await
        .map_err(|_| LaunchError::Timeout(timeout))??;

        if !output.status.success() {
            return Err(LaunchError::Exited {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

/// Control half for a real child process.
struct CliProcessControl {
    child: tokio::sync::Mutex<Option<Child>>,
    stderr_task: tokio::sync::Mutex<Option<JoinHandle<String>>>,
    terminated: AtomicBool,
}

#[async_trait]
impl ProcessControl for CliProcessControl {
    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            // kill_on_drop backs this up; a second kill on an exited
            // process is harmless.
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "terminate on exited process");
            }
        }
    }

    async fn finish(&self) -> TurnExit {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return TurnExit::Terminated;
        };
        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "failed to await agent process");
                return TurnExit::Failed {
                    code: None,
                    stderr: e.to_string(),
                };
            }
        };
        let stderr = match self.stderr_task.lock().await.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if self.terminated.load(Ordering::SeqCst) {
            return TurnExit::Terminated;
        }
        if status.success() {
            TurnExit::Clean { stderr }
        } else {
            debug!(code = ?status.code(), "agent process exited non-zero");
            TurnExit::Failed {
                code: status.code(),
                stderr,
            }
        }
    }
}
