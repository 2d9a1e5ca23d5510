//! One agent session under a hard deadline.
//!
//! The whole session (start plus stream consumption) runs in its own task,
//! raced against a timer:
//!
//! ```text
//!   spawn(drive) ──┐
//!                  ├─ select! ─► first to finish wins
//!   sleep(limit) ──┘              deadline: abort + drop, never joined
//! ```
//!
//! The deadline does not depend on the agent runtime yielding. Counters
//! observed before the deadline are kept; the response is not trusted.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use autonomy::{classify, ErrorCategory, SessionHealth, WatchdogHandle};
use futures::StreamExt;
use regex::Regex;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::runtime::{AgentRuntime, SessionEvent};
use crate::tracker::IssueStatus;

/// Tracker identifiers such as `COD-42`.
static ITEM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z]{2,5}-\d+\b").expect("ITEM_ID_RE regex should compile")
});

/// Tool namespace of the issue tracker.
pub const TRACKER_TOOL_PREFIX: &str = "mcp__linear__";

const STATE_KEYS: &[&str] = &["state", "status", "stateName"];
const ID_KEYS: &[&str] = &["id", "issueId", "identifier"];

const ECHO_PREVIEW_LEN: usize = 200;
const BLOCKED_REASON_LEN: usize = 500;

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Stream ended cleanly; the agent should keep going next iteration.
    Continue { response: String },
    Error {
        category: ErrorCategory,
        message: String,
    },
    Timeout { after: Duration },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Continue { .. })
    }

    /// Category recorded as the failure cause. Timeouts count as transient.
    pub fn failure_category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Continue { .. } => None,
            Self::Error { category, .. } => Some(*category),
            Self::Timeout { .. } => Some(ErrorCategory::Transient),
        }
    }

    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::Continue { .. } => None,
            Self::Error { message, .. } => Some(message.clone()),
            Self::Timeout { after } => Some(format!(
                "session timeout after {}s",
                after.as_secs()
            )),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue { .. } => "continue",
            Self::Error { .. } => "error",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// What a finished session leaves behind for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Last tool result refused by the command gate, if any.
    pub last_blocked: Option<String>,
}

/// Unique tracker identifiers in order of first appearance.
pub fn extract_item_ids(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ITEM_ID_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// Items a tracker tool call moves to a finished state.
///
/// Only `mcp__linear__*` calls whose input sets a done-like state count;
/// identifiers mentioned anywhere else are ignored.
pub fn completed_item_ids(tool: &str, input: &serde_json::Value) -> Vec<String> {
    let Some(fields) = input.as_object() else {
        return Vec::new();
    };
    if !tool.starts_with(TRACKER_TOOL_PREFIX) {
        return Vec::new();
    }
    let finished = STATE_KEYS
        .iter()
        .filter_map(|key| fields.get(*key).and_then(|v| v.as_str()))
        .any(|state| IssueStatus::from_name(state) == IssueStatus::Done);
    if !finished {
        return Vec::new();
    }

    let ids: Vec<&str> = ID_KEYS
        .iter()
        .filter_map(|key| fields.get(*key).and_then(|v| v.as_str()))
        .collect();
    extract_item_ids(&ids.join(" "))
}

struct SessionMonitor {
    health: SessionHealth,
    watchdog: WatchdogHandle,
    echo: bool,
    response: String,
    last_blocked: Option<String>,
}

impl SessionMonitor {
    fn observe(&mut self, event: SessionEvent) {
        self.watchdog.pet();
        self.health.record_activity();

        match event {
            SessionEvent::Text(text) => {
                if self.echo {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                self.response.push_str(&text);
            }
            SessionEvent::ToolCall { name, input } => {
                for id in completed_item_ids(&name, &input) {
                    self.health.record_item(id);
                }
                let input = input.to_string();
                if self.echo {
                    println!("\n[Tool: {name}]");
                    println!("   Input: {}", truncate(&input, ECHO_PREVIEW_LEN));
                }
                debug!(tool = %name, "tool call");
            }
            SessionEvent::ToolResult { content, is_error } => {
                if content.to_lowercase().contains("blocked") {
                    warn!(reason = %truncate(&content, ECHO_PREVIEW_LEN), "command blocked by security gate");
                    self.health.record_error(ErrorCategory::PolicyBlocked);
                    self.last_blocked = Some(truncate(&content, BLOCKED_REASON_LEN));
                    if self.echo {
                        println!("   [BLOCKED] {}", truncate(&content, ECHO_PREVIEW_LEN));
                    }
                } else if is_error {
                    let category = classify(&content);
                    debug!(%category, "tool error");
                    self.health.record_error(category);
                    if self.echo {
                        println!("   [Error] {}", truncate(&content, BLOCKED_REASON_LEN));
                    }
                } else if self.echo {
                    println!("   [Done]");
                }
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn lock(monitor: &Mutex<SessionMonitor>) -> MutexGuard<'_, SessionMonitor> {
    monitor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one session to completion, failure, or deadline.
///
/// `health` is replaced with the counters observed by the session task,
/// including on deadline.
pub async fn run_session(
    runtime: Arc<dyn AgentRuntime>,
    task: &str,
    health: &mut SessionHealth,
    watchdog: &WatchdogHandle,
    timeout: Duration,
    echo: bool,
) -> SessionReport {
    let monitor = Arc::new(Mutex::new(SessionMonitor {
        health: std::mem::take(health),
        watchdog: watchdog.clone(),
        echo,
        response: String::new(),
        last_blocked: None,
    }));

    let drive = {
        let monitor = Arc::clone(&monitor);
        let task = task.to_string();
        async move {
            let mut events = runtime.start_session(&task).await?;
            while let Some(event) = events.next().await {
                let event = event?;
                lock(&monitor).observe(event);
            }
            anyhow::Ok(())
        }
    };
    // Dropping the handle (deadline, or the caller being cancelled) aborts the task.
    let mut driver = AbortOnDropHandle::new(tokio::spawn(drive));

    let result = tokio::select! {
        joined = &mut driver => Some(joined),
        _ = tokio::time::sleep(timeout) => None,
    };
    if result.is_none() {
        driver.abort();
    }
    drop(driver);

    let mut monitor = lock(&monitor);
    if monitor.echo {
        println!("\n{}\n", "-".repeat(70));
    }

    let outcome = match result {
        Some(Ok(Ok(()))) => SessionOutcome::Continue {
            response: std::mem::take(&mut monitor.response),
        },
        Some(Ok(Err(e))) => {
            let message = format!("{e:#}");
            let category = classify(&message);
            monitor.health.record_error(category);
            warn!(%category, error = %message, advice = category.advice(), "session failed");
            SessionOutcome::Error { category, message }
        }
        Some(Err(e)) => {
            let message = format!("session task failed: {e}");
            let category = classify(&message);
            monitor.health.record_error(category);
            warn!(%category, error = %message, "session task did not complete");
            SessionOutcome::Error { category, message }
        }
        None => {
            warn!(timeout_secs = timeout.as_secs(), "session deadline reached, abandoning session");
            SessionOutcome::Timeout { after: timeout }
        }
    };
    info!(
        outcome = outcome.label(),
        events = monitor.health.tool_calls(),
        errors = monitor.health.errors(),
        "session finished"
    );

    *health = monitor.health.clone();
    SessionReport {
        outcome,
        last_blocked: monitor.last_blocked.take(),
    }
}
