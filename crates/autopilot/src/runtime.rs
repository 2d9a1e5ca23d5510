//! Agent runtime boundary.
//!
//! A session is one call to [`AgentRuntime::start_session`] followed by
//! draining the returned event stream. The orchestrator never sees the agent
//! process directly; everything it learns arrives as a [`SessionEvent`].
//!
//! ```text
//! claude -p --output-format stream-json
//!     stdout line ──► parse_stream_line ──► Vec<SessionEvent> ──► EventStream
//!     exit != 0   ──► Err(stderr)
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settings file handed to the agent CLI, relative to the project directory.
pub const SETTINGS_FILE: &str = ".claude_settings.json";

/// One observable thing the agent did.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Text(String),
    ToolCall { name: String, input: Value },
    ToolResult { content: String, is_error: bool },
}

pub type EventStream = BoxStream<'static, Result<SessionEvent>>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start a session for `task`. Errors here and errors yielded by the
    /// stream are both session failures.
    async fn start_session(&self, task: &str) -> Result<EventStream>;
}

// ── Stream parsing ──────────────────────────────────────────────────

/// Translate one stdout line of `--output-format stream-json`.
///
/// Unknown record types yield nothing. A `result` record flagged as an error
/// yields `Err` carrying the agent's own message.
pub fn parse_stream_line(line: &str) -> Result<Vec<SessionEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let record: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Ok(vec![SessionEvent::Text(line.to_string())]),
    };

    let blocks = || {
        record
            .pointer("/message/content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    match record.get("type").and_then(Value::as_str) {
        Some("assistant") => Ok(blocks()
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str)? {
                "text" => block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| SessionEvent::Text(t.to_string())),
                "tool_use" => Some(SessionEvent::ToolCall {
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            })
            .collect()),
        Some("user") => Ok(blocks()
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| SessionEvent::ToolResult {
                content: tool_result_text(block.get("content")),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect()),
        Some("result") => {
            let subtype = record.get("subtype").and_then(Value::as_str).unwrap_or("");
            let is_error = record
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || subtype.starts_with("error");
            if is_error {
                let message = record
                    .get("result")
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .unwrap_or(subtype);
                Err(anyhow!("agent session failed: {message} ({subtype})"))
            } else {
                Ok(Vec::new())
            }
        }
        _ => Ok(Vec::new()),
    }
}

/// Tool result content is either a string or a list of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

// ── Claude CLI adapter ──────────────────────────────────────────────

/// Runs each session as a fresh `claude -p` process in the project directory.
#[derive(Debug, Clone)]
pub struct ClaudeCliRuntime {
    program: String,
    model: String,
    project_dir: PathBuf,
    hook_command: Option<String>,
}

impl ClaudeCliRuntime {
    pub fn new(
        program: impl Into<String>,
        model: impl Into<String>,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            project_dir: project_dir.into(),
            hook_command: None,
        }
    }

    /// Shell command registered as the pre-tool-use gate for `Bash`.
    pub fn with_hook_command(mut self, command: impl Into<String>) -> Self {
        self.hook_command = Some(command.into());
        self
    }

    pub fn settings_path(&self) -> PathBuf {
        self.project_dir.join(SETTINGS_FILE)
    }

    fn settings(&self) -> Value {
        let mut settings = serde_json::json!({
            "permissions": {
                "defaultMode": "acceptEdits",
                "allow": ["Read(./**)", "Write(./**)", "Edit(./**)", "Glob(./**)", "Grep(./**)", "Bash(*)"]
            }
        });
        if let Some(hook) = &self.hook_command {
            settings["hooks"] = serde_json::json!({
                "PreToolUse": [{
                    "matcher": "Bash",
                    "hooks": [{ "type": "command", "command": hook }]
                }]
            });
        }
        settings
    }

    fn write_settings(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.project_dir)
            .with_context(|| format!("creating {}", self.project_dir.display()))?;
        let path = self.settings_path();
        let content = serde_json::to_string_pretty(&self.settings())?;
        std::fs::write(&path, content)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

#[async_trait]
impl AgentRuntime for ClaudeCliRuntime {
    async fn start_session(&self, task: &str) -> Result<EventStream> {
        let settings = self.write_settings()?;

        let mut command = Command::new(&self.program);
        command
            .current_dir(&self.project_dir)
            .arg("-p")
            .args(["--output-format", "stream-json", "--verbose"])
            .arg("--model")
            .arg(&self.model)
            .arg("--settings")
            .arg(&settings)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(program = %self.program, model = %self.model, dir = %self.project_dir.display(), "spawning agent session");
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn agent command `{}`", self.program))?;

        let mut stdin = child.stdin.take().context("agent stdin missing")?;
        let stdout = child.stdout.take().context("agent stdout missing")?;
        let mut stderr = child.stderr.take().context("agent stderr missing")?;

        let task = task.to_string();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(task.as_bytes()).await {
                warn!(error = %e, "failed to write task to agent stdin");
            }
            // dropping stdin closes the pipe
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let reader = ChildReader {
            lines: BufReader::new(stdout).lines(),
            pending: VecDeque::new(),
            child,
            stderr: Some(stderr_task),
            finished: false,
        };
        Ok(stream::unfold(reader, ChildReader::next_event).boxed())
    }
}

/// Owns the child for the lifetime of the stream; dropping it kills the agent.
struct ChildReader {
    lines: Lines<BufReader<ChildStdout>>,
    pending: VecDeque<SessionEvent>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

impl ChildReader {
    async fn next_event(mut self) -> Option<(Result<SessionEvent>, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((Ok(event), self));
            }
            if self.finished {
                return None;
            }
            match self.lines.next_line().await {
                Ok(Some(line)) => match parse_stream_line(&line) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => {
                        self.finished = true;
                        return Some((Err(e), self));
                    }
                },
                Ok(None) => {
                    self.finished = true;
                    return self.exit_error().await.map(|e| (Err(e), self));
                }
                Err(e) => {
                    self.finished = true;
                    return Some((Err(anyhow!(e).context("reading agent output")), self));
                }
            }
        }
    }

    async fn exit_error(&mut self) -> Option<anyhow::Error> {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => return Some(anyhow!(e).context("waiting for agent process")),
        };
        debug!(?status, "agent process exited");
        if status.success() {
            return None;
        }
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Some(anyhow!(
            "agent process exited with {status}: {}",
            stderr.trim()
        ))
    }
}
