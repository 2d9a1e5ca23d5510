//! Issue tracker collaborator
//!
//! The session loop only needs three things from the tracker: a summary of
//! outstanding work to inject into the next task, whether all tracked work is
//! done, and somewhere to park writes while the tracker is unreliable.
//!
//! ```text
//! LinearTracker
//!   ├── project.rs  .linear_project.json   (initialized?, project id, cached counts)
//!   ├── cache.rs    .linear_issue_cache.json (TTL issue snapshot, stale fallback)
//!   └── pending.rs  .linear_pending.json   (deferred writes during degraded mode)
//! ```

pub mod cache;
pub mod linear;
pub mod pending;
pub mod project;

use std::path::Path;

use async_trait::async_trait;
use autonomy::StaleWorkDetector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use linear::LinearTracker;
pub use pending::PendingOperation;

/// Todo issues listed in the rendered summary.
const RENDERED_TODO_LIMIT: usize = 15;

/// Tracker failures. Remote failures carry a `linear api:` prefix so they
/// classify as external-API errors.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("linear api: request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("linear api: HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("linear api: graphql errors: {0}")]
    Graphql(String),

    #[error("linear api: malformed response: {0}")]
    Malformed(String),

    #[error("linear project not initialized in {0}")]
    NotInitialized(String),

    #[error("tracker file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker file error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Deferred-write and work-status interface used by the orchestrator.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Counts, in-progress and todo items, and stale in-progress items.
    async fn get_work_summary(&self) -> Result<WorkSummary, TrackerError>;

    /// Whether every tracked item is done.
    async fn report_completion(&self) -> Result<bool, TrackerError>;

    /// Park a write for later replay.
    async fn queue_pending_operation(
        &self,
        item_id: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<(), TrackerError>;

    /// Writes waiting for replay.
    fn pending_count(&self) -> usize;

    fn pending_operations(&self) -> Vec<PendingOperation>;

    /// Forget replayed writes. Returns how many were dropped.
    fn clear_pending(&self) -> Result<usize, TrackerError>;

    /// Whether the project has been set up in the tracker yet.
    fn is_initialized(&self) -> bool;
}

/// Workflow bucket for a tracker status name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Todo,
    InProgress,
    Done,
    Other,
}

impl IssueStatus {
    /// Bucket a raw status name (`"In Progress"`, `"Backlog"`, ...).
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().replace(' ', "_").as_str() {
            "todo" | "backlog" | "triage" => Self::Todo,
            "in_progress" => Self::InProgress,
            "done" | "completed" | "closed" => Self::Done,
            _ => Self::Other,
        }
    }
}

/// One tracked work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl TrackedIssue {
    pub fn bucket(&self) -> IssueStatus {
        IssueStatus::from_name(&self.status)
    }

    /// Sort key: urgent (1) first, unprioritized (0/None) last.
    fn priority_rank(&self) -> u8 {
        match self.priority {
            Some(p) if p > 0 => p,
            _ => 99,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub todo: u32,
    pub in_progress: u32,
    pub done: u32,
    pub total: u32,
}

impl IssueCounts {
    pub fn from_issues(issues: &[TrackedIssue]) -> Self {
        let mut counts = Self {
            total: issues.len() as u32,
            ..Self::default()
        };
        for issue in issues {
            match issue.bucket() {
                IssueStatus::Todo => counts.todo += 1,
                IssueStatus::InProgress => counts.in_progress += 1,
                IssueStatus::Done => counts.done += 1,
                IssueStatus::Other => {}
            }
        }
        counts
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

/// In-progress item old enough to imply an abandoned session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleItem {
    pub identifier: String,
    pub title: String,
    pub updated_at: String,
}

/// Snapshot of outstanding work for one task description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkSummary {
    pub counts: IssueCounts,
    pub in_progress: Vec<TrackedIssue>,
    /// Sorted by priority.
    pub todo: Vec<TrackedIssue>,
    pub stale_items: Vec<StaleItem>,
    pub meta_issue: Option<TrackedIssue>,
    pub from_cache: bool,
    /// Served from an expired cache because the API failed.
    pub stale_cache: bool,
    pub cache_age_secs: Option<u64>,
}

impl WorkSummary {
    pub fn from_issues(
        issues: &[TrackedIssue],
        detector: &StaleWorkDetector,
        now: DateTime<Utc>,
    ) -> Self {
        let in_progress: Vec<TrackedIssue> = issues
            .iter()
            .filter(|i| i.bucket() == IssueStatus::InProgress)
            .cloned()
            .collect();

        let stale_items = in_progress
            .iter()
            .filter_map(|issue| {
                let updated_at = issue.updated_at.as_deref()?;
                detector.is_stale_at(updated_at, now).then(|| StaleItem {
                    identifier: issue.identifier.clone(),
                    title: issue.title.clone(),
                    updated_at: updated_at.to_string(),
                })
            })
            .collect();

        let mut todo: Vec<TrackedIssue> = issues
            .iter()
            .filter(|i| i.bucket() == IssueStatus::Todo)
            .cloned()
            .collect();
        todo.sort_by_key(TrackedIssue::priority_rank);

        Self {
            counts: IssueCounts::from_issues(issues),
            in_progress,
            todo,
            stale_items,
            meta_issue: issues.iter().find(|i| i.title.contains("[META]")).cloned(),
            from_cache: false,
            stale_cache: false,
            cache_age_secs: None,
        }
    }

    /// Markdown block injected into the task description.
    pub fn render_markdown(&self) -> String {
        let mut lines = Vec::new();

        let age = self.cache_age_secs.unwrap_or(0);
        lines.push(match (self.from_cache, self.stale_cache) {
            (true, true) => {
                format!("**Issue data from STALE cache ({age}s old) - tracker API unavailable**")
            }
            (true, false) => format!("**Issue data from cache ({age}s old)**"),
            _ => "**Issue data fresh from the tracker API**".to_string(),
        });
        lines.push(String::new());

        let c = &self.counts;
        lines.push(format!("### Progress: {}/{} Done", c.done, c.total));
        lines.push(format!("- Todo: {}", c.todo));
        lines.push(format!("- In Progress: {}", c.in_progress));
        lines.push(format!("- Done: {}", c.done));
        lines.push(String::new());

        if let Some(meta) = &self.meta_issue {
            lines.push(format!("### META Issue: {} - {}", meta.identifier, meta.title));
            lines.push(format!("ID: `{}`", meta.id));
            lines.push(String::new());
        }

        if !self.in_progress.is_empty() {
            lines.push("### IN PROGRESS ISSUES (Priority!)".to_string());
            lines.push(
                "*These may be left over from interrupted sessions - check and complete first*"
                    .to_string(),
            );
            lines.push(String::new());
            for issue in &self.in_progress {
                lines.push(format!("- **{}**: {}", issue.identifier, issue.title));
                lines.push(format!("  - ID: `{}`", issue.id));
                lines.push(format!(
                    "  - Updated: {}",
                    issue.updated_at.as_deref().unwrap_or("Unknown")
                ));
            }
            lines.push(String::new());
        }

        if !self.todo.is_empty() {
            lines.push("### TODO ISSUES (by priority)".to_string());
            lines.push(String::new());
            for issue in self.todo.iter().take(RENDERED_TODO_LIMIT) {
                let priority = match issue.priority {
                    Some(p) if p > 0 => format!("P{p}"),
                    _ => "P?".to_string(),
                };
                lines.push(format!(
                    "- **[{priority}] {}**: {}",
                    issue.identifier, issue.title
                ));
                lines.push(format!("  - ID: `{}`", issue.id));
            }
            if self.todo.len() > RENDERED_TODO_LIMIT {
                lines.push(format!(
                    "- ... and {} more Todo issues",
                    self.todo.len() - RENDERED_TODO_LIMIT
                ));
            }
            lines.push(String::new());
        }

        if c.done > 0 {
            lines.push(format!("### DONE: {} issues completed", c.done));
            lines.push(String::new());
        }

        lines.join("\n")
    }
}

/// Pretty JSON to `<path>.tmp`, then rename over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), TrackerError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = std::path::PathBuf::from(temp_name);

    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
