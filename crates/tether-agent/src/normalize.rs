//! Stream-json normalization.
//!
//! The agent CLI emits one JSON object per stdout line, in one of two
//! structurally different shapes depending on version and verbosity:
//!
//! - **Incremental**: `content_block_start` / `content_block_delta` /
//!   `content_block_stop` sequences while the reply streams.
//! - **Complete**: one `assistant` event carrying the whole reply's
//!   content blocks.
//!
//! Both converge on the same outbound [`ServerEvent`] variants here, so
//! downstream consumers never need to know which shape occurred. The
//! normalizer also accumulates the turn's persistable records (text
//! segmented by tool use) and the terminal `result` payload.
//!
//! Malformed lines are skipped, never fatal: one bad line must not abort
//! an otherwise healthy stream.

use std::path::PathBuf;

use metrics::counter;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use tether_core::events::ServerEvent;
use tether_core::history::Segment;
use tether_core::ids::ConversationId;
use tether_core::text::{clip, clip_ellipsis};

/// Max bytes of a tool input summary.
const SUMMARY_MAX: usize = 80;
/// Accumulated fragment length before attempting an early input parse.
const EARLY_PARSE_MIN: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Raw upstream shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawEvent {
    ContentBlockStart {
        #[serde(default)]
        content_block: RawBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        delta: RawDelta,
    },
    ContentBlockStop,
    Assistant {
        #[serde(default)]
        message: RawMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        errors: Vec<Value>,
    },
    /// Anything else the agent emits (`system`, `user`, usage frames...).
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct RawBlock {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDelta {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    partial_json: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContent>,
}

#[derive(Debug, Default, Deserialize)]
struct RawContent {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Accumulated output
// ─────────────────────────────────────────────────────────────────────────────

/// One persistable record with the images it produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnRecord {
    /// Text or tool-use segment.
    pub segment: Segment,
    /// Image files this record produced.
    pub image_paths: Vec<String>,
}

/// What a finished stream leaves behind for persistence and retry policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizedTurn {
    /// Ordered records, text split wherever a tool ran.
    pub records: Vec<TurnRecord>,
    /// Resume token from the terminal result, absent on error/cancel.
    pub session_id: Option<String>,
    /// Whether the terminal result flagged an error.
    pub result_error: bool,
    /// Error text from the terminal result.
    pub error_detail: Option<String>,
}

impl NormalizedTurn {
    /// Whether any text output was produced.
    #[must_use]
    pub fn has_text_output(&self) -> bool {
        self.records.iter().any(|r| match &r.segment {
            Segment::Text { text } => !text.trim().is_empty(),
            Segment::ToolUse { .. } => false,
        })
    }
}

/// In-flight tool block state (the tool-input accumulator).
struct ActiveTool {
    name: String,
    partial_json: String,
    start_sent: bool,
    summary: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalizer
// ─────────────────────────────────────────────────────────────────────────────

/// Per-turn stream normalizer. Create one per launch attempt.
pub struct Normalizer {
    conversation_id: ConversationId,
    working_dir: PathBuf,
    screenshot_tools: Vec<String>,
    /// Any block-level streaming events observed — gates the `assistant`
    /// fallback so content is never forwarded twice.
    saw_stream_events: bool,
    /// Text deltas specifically — gates `assistant` text accumulation.
    saw_text_deltas: bool,
    active_tool: Option<ActiveTool>,
    records: Vec<TurnRecord>,
    session_id: Option<String>,
    result_error: bool,
    error_detail: Option<String>,
}

impl Normalizer {
    /// Create a normalizer for one turn.
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        working_dir: PathBuf,
        screenshot_tools: Vec<String>,
    ) -> Self {
        Self {
            conversation_id,
            working_dir,
            screenshot_tools,
            saw_stream_events: false,
            saw_text_deltas: false,
            active_tool: None,
            records: Vec::new(),
            session_id: None,
            result_error: false,
            error_detail: None,
        }
    }

    /// Process one raw output line, returning the events to forward.
    pub fn handle_line(&mut self, line: &str) -> Vec<ServerEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let event: RawEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                counter!("agent_malformed_lines_total").increment(1);
                debug!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "skipping malformed output line"
                );
                return Vec::new();
            }
        };
        match event {
            RawEvent::ContentBlockStart { content_block } => self.on_block_start(content_block),
            RawEvent::ContentBlockDelta { delta } => self.on_block_delta(&delta),
            RawEvent::ContentBlockStop => self.on_block_stop(),
            RawEvent::Assistant { message } => self.on_assistant(message),
            RawEvent::Result {
                is_error,
                session_id,
                result,
                errors,
            } => self.on_result(is_error, session_id, result, &errors),
            RawEvent::Other => Vec::new(),
        }
    }

    /// Consume the normalizer, yielding the turn's accumulated output.
    #[must_use]
    pub fn finish(mut self) -> NormalizedTurn {
        self.records.retain(|r| !r.segment.is_empty() || !r.image_paths.is_empty());
        NormalizedTurn {
            records: self.records,
            session_id: self.session_id,
            result_error: self.result_error,
            error_detail: self.error_detail,
        }
    }

    fn on_block_start(&mut self, block: RawBlock) -> Vec<ServerEvent> {
        self.saw_stream_events = true;
        if block.kind != "tool_use" {
            return Vec::new();
        }
        let mut active = ActiveTool {
            name: block.name,
            partial_json: String::new(),
            start_sent: false,
            summary: String::new(),
        };
        let mut out = Vec::new();
        if !block.input.is_empty() {
            // Input arrived complete with the block start.
            active.partial_json = serde_json::to_string(&block.input).unwrap_or_default();
            let summary = summarize_tool_input(&active.name, &block.input);
            if !summary.is_empty() {
                active.start_sent = true;
                active.summary.clone_from(&summary);
                out.push(ServerEvent::ToolStart {
                    conversation_id: self.conversation_id.clone(),
                    tool: active.name.clone(),
                    input_summary: summary,
                });
            }
        }
        self.active_tool = Some(active);
        out
    }

    fn on_block_delta(&mut self, delta: &RawDelta) -> Vec<ServerEvent> {
        self.saw_stream_events = true;
        match delta.kind.as_str() {
            "text_delta" => {
                self.saw_text_deltas = true;
                self.append_text(&delta.text);
                vec![ServerEvent::TextDelta {
                    conversation_id: self.conversation_id.clone(),
                    text: delta.text.clone(),
                }]
            }
            "input_json_delta" => {
                let Some(active) = self.active_tool.as_mut() else {
                    return Vec::new();
                };
                active.partial_json.push_str(&delta.partial_json);
                // Emit tool_start as soon as enough input parses to build
                // a summary; otherwise keep accumulating until block stop.
                if !active.start_sent && active.partial_json.len() > EARLY_PARSE_MIN {
                    if let Ok(Value::Object(input)) = serde_json::from_str(&active.partial_json) {
                        let summary = summarize_tool_input(&active.name, &input);
                        if !summary.is_empty() {
                            active.start_sent = true;
                            active.summary.clone_from(&summary);
                            return vec![ServerEvent::ToolStart {
                                conversation_id: self.conversation_id.clone(),
                                tool: active.name.clone(),
                                input_summary: summary,
                            }];
                        }
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_block_stop(&mut self) -> Vec<ServerEvent> {
        let Some(active) = self.active_tool.take() else {
            return Vec::new();
        };
        let mut out = Vec::new();

        let input: Option<Map<String, Value>> = serde_json::from_str(&active.partial_json)
            .ok()
            .and_then(|v: Value| match v {
                Value::Object(map) => Some(map),
                _ => None,
            });
        let summary = input
            .as_ref()
            .map(|map| summarize_tool_input(&active.name, map))
            .filter(|s| !s.is_empty())
            .or_else(|| (!active.summary.is_empty()).then(|| active.summary.clone()))
            .unwrap_or_else(|| clip_ellipsis(&active.partial_json, SUMMARY_MAX));

        if !active.start_sent {
            out.push(ServerEvent::ToolStart {
                conversation_id: self.conversation_id.clone(),
                tool: active.name.clone(),
                input_summary: summary.clone(),
            });
        }

        let image_paths = self.extract_screenshot(&active.name, input.as_ref());
        for path in &image_paths {
            out.push(ServerEvent::Image {
                conversation_id: self.conversation_id.clone(),
                path: path.clone(),
            });
        }

        self.records.push(TurnRecord {
            segment: Segment::tool_use(active.name, summary),
            image_paths,
        });
        out.push(ServerEvent::ToolDone {
            conversation_id: self.conversation_id.clone(),
        });
        out
    }

    fn on_assistant(&mut self, message: RawMessage) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        for block in message.content {
            match block.kind.as_str() {
                "text" => {
                    // Streaming deltas already carried this text.
                    if !self.saw_text_deltas {
                        self.append_text(&block.text);
                    }
                    if !self.saw_stream_events {
                        out.push(ServerEvent::TextDelta {
                            conversation_id: self.conversation_id.clone(),
                            text: block.text,
                        });
                    }
                }
                "tool_use" => {
                    // Block events already announced and recorded tools.
                    if self.saw_stream_events {
                        continue;
                    }
                    let summary = summarize_tool_input(&block.name, &block.input);
                    out.push(ServerEvent::ToolStart {
                        conversation_id: self.conversation_id.clone(),
                        tool: block.name.clone(),
                        input_summary: summary.clone(),
                    });
                    let image_paths = self.extract_screenshot(&block.name, Some(&block.input));
                    for path in &image_paths {
                        out.push(ServerEvent::Image {
                            conversation_id: self.conversation_id.clone(),
                            path: path.clone(),
                        });
                    }
                    self.records.push(TurnRecord {
                        segment: Segment::tool_use(block.name, summary),
                        image_paths,
                    });
                    out.push(ServerEvent::ToolDone {
                        conversation_id: self.conversation_id.clone(),
                    });
                }
                _ => {}
            }
        }
        out
    }

    fn on_result(
        &mut self,
        is_error: bool,
        session_id: Option<String>,
        result: Option<String>,
        errors: &[Value],
    ) -> Vec<ServerEvent> {
        self.result_error = is_error;
        if is_error {
            // Never keep session ids from failed results; they would
            // poison future --resume attempts.
            let detail = result
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    (!errors.is_empty()).then(|| {
                        errors
                            .iter()
                            .map(|e| e.as_str().map_or_else(|| e.to_string(), str::to_owned))
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
                })
                .unwrap_or_else(|| "agent reported an error".to_owned());
            self.error_detail = Some(detail);
            return Vec::new();
        }
        if session_id.is_some() {
            self.session_id = session_id;
        }
        // Some agent versions only put the reply text on the result line.
        if let Some(text) = result.filter(|s| !s.is_empty()) {
            if !self.has_text_record() {
                self.append_text(&text);
                return vec![ServerEvent::TextDelta {
                    conversation_id: self.conversation_id.clone(),
                    text,
                }];
            }
        }
        Vec::new()
    }

    fn has_text_record(&self) -> bool {
        self.records.iter().any(|r| match &r.segment {
            Segment::Text { text } => !text.trim().is_empty(),
            Segment::ToolUse { .. } => false,
        })
    }

    fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(TurnRecord {
            segment: Segment::Text { text: existing },
            ..
        }) = self.records.last_mut()
        {
            existing.push_str(text);
        } else {
            self.records.push(TurnRecord {
                segment: Segment::text(text),
                image_paths: Vec::new(),
            });
        }
    }

    fn extract_screenshot(
        &self,
        tool: &str,
        input: Option<&Map<String, Value>>,
    ) -> Vec<String> {
        if !self.screenshot_tools.iter().any(|t| t == tool) {
            return Vec::new();
        }
        let Some(filename) = input
            .and_then(|map| map.get("filename"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            return Vec::new();
        };
        let path = std::path::Path::new(filename);
        let resolved = if path.is_absolute() {
            filename.to_owned()
        } else {
            self.working_dir.join(path).to_string_lossy().into_owned()
        };
        vec![resolved]
    }
}

/// Human-readable digest of a tool's input — the interesting field per
/// tool, clipped. Never the raw payload.
fn summarize_tool_input(tool: &str, input: &Map<String, Value>) -> String {
    let field = |key: &str| {
        input
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };
    match tool {
        "Read" | "Glob" | "Grep" => field("file_path")
            .or_else(|| field("pattern"))
            .or_else(|| field("path"))
            .unwrap_or_default(),
        "Edit" | "Write" => field("file_path").unwrap_or_default(),
        "Bash" => field("command")
            .map(|c| clip_ellipsis(&c, SUMMARY_MAX))
            .unwrap_or_default(),
        "Task" => field("description")
            .or_else(|| field("prompt").map(|p| clip(&p, SUMMARY_MAX).to_owned()))
            .unwrap_or_default(),
        "TodoWrite" => {
            let todos = input
                .get("todos")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            todos
                .iter()
                .find(|t| t.get("status").and_then(Value::as_str) == Some("in_progress"))
                .and_then(|t| t.get("content").and_then(Value::as_str))
                .map_or_else(|| format!("{} items", todos.len()), str::to_owned)
        }
        "WebSearch" => field("query").unwrap_or_default(),
        "WebFetch" => field("url").unwrap_or_default(),
        "NotebookEdit" => field("notebook_path").unwrap_or_default(),
        // Unknown tools (e.g. externally configured ones): first string
        // value beats dumping the raw input object.
        _ => input
            .values()
            .find_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| clip_ellipsis(s, SUMMARY_MAX))
            .unwrap_or_default(),
    }
}
