//! Task templates and per-session task composition.
//!
//! Templates ship inside the binary and can be overridden file by file from a
//! prompts directory. The final task for a session is the template for its
//! [`TaskKind`] prefixed by whatever advisories the loop has accumulated
//! (degraded mode, a blocked command, stale work, the current work summary).

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::tracker::PendingOperation;

/// Port assumed when the project does not pin one.
pub const DEFAULT_DEV_PORT: u16 = 3000;

pub const APP_SPEC_FILE: &str = "app_spec.txt";

const INITIALIZER_PROMPT: &str = include_str!("../prompts/initializer_prompt.md");
const CODING_PROMPT: &str = include_str!("../prompts/coding_prompt.md");
const ADD_FEATURES_PROMPT: &str = include_str!("../prompts/add_features_prompt.md");
const ADD_SPEC_PROMPT: &str = include_str!("../prompts/add_spec_prompt.md");

/// `-p 3008`, `--port 3008`, `-p=3008`, `--port=3008`.
static DEV_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:-p|--port)[=\s]+(\d+)").expect("DEV_PORT_RE regex should compile")
});

/// Which template a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// First session of a fresh project: create tracker issues and scaffold.
    Initialize,
    /// Regular coding session.
    Continue,
    /// Turn an updated `app_spec.txt` into new issues.
    AddFeatures,
    /// Turn the named spec file into new issues.
    AddSpec(String),
}

impl TaskKind {
    pub fn template_name(&self) -> &'static str {
        match self {
            Self::Initialize => "initializer_prompt",
            Self::Continue => "coding_prompt",
            Self::AddFeatures => "add_features_prompt",
            Self::AddSpec(_) => "add_spec_prompt",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialize => write!(f, "initialize"),
            Self::Continue => write!(f, "continue"),
            Self::AddFeatures => write!(f, "add_features"),
            Self::AddSpec(file) => write!(f, "add_spec({file})"),
        }
    }
}

// ── Template library ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    dir: Option<PathBuf>,
}

impl PromptLibrary {
    /// Built-in templates only.
    pub fn builtin() -> Self {
        Self { dir: None }
    }

    /// Templates from `dir`, falling back to the built-in ones per file.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn builtin_template(name: &str) -> &'static str {
        match name {
            "initializer_prompt" => INITIALIZER_PROMPT,
            "add_features_prompt" => ADD_FEATURES_PROMPT,
            "add_spec_prompt" => ADD_SPEC_PROMPT,
            _ => CODING_PROMPT,
        }
    }

    /// Raw template text for `name` (without the `.md` suffix).
    pub fn template(&self, name: &str) -> String {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{name}.md"));
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    debug!(path = %path.display(), "loaded prompt override");
                    return text;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "prompt override unreadable, using built-in");
                }
            }
        }
        Self::builtin_template(name).to_string()
    }

    /// Template for `kind` with placeholders filled in.
    pub fn render(&self, kind: &TaskKind, dev_port: u16) -> String {
        let mut text = self
            .template(kind.template_name())
            .replace("{DEV_PORT}", &dev_port.to_string());
        if let TaskKind::AddSpec(file) = kind {
            text = text.replace("{SPEC_FILE}", file);
        }
        text
    }

    /// Copy `app_spec.txt` from the prompts directory into a fresh project.
    ///
    /// Returns whether a copy happened. An existing project copy is never
    /// overwritten.
    pub fn copy_spec_to_project(&self, project_dir: &Path) -> Result<bool> {
        let dest = project_dir.join(APP_SPEC_FILE);
        if dest.exists() {
            return Ok(false);
        }
        let Some(source) = self
            .dir
            .as_ref()
            .map(|d| d.join(APP_SPEC_FILE))
            .filter(|p| p.exists())
        else {
            warn!(project = %project_dir.display(), "no {APP_SPEC_FILE} to copy; the initializer will have nothing to read");
            return Ok(false);
        };

        std::fs::create_dir_all(project_dir)
            .with_context(|| format!("creating {}", project_dir.display()))?;
        std::fs::copy(&source, &dest)
            .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;
        info!(dest = %dest.display(), "copied {APP_SPEC_FILE} into project");
        Ok(true)
    }
}

/// Dev server port from the `dev` script in `package.json`, else 3000.
pub fn detect_dev_port(project_dir: &Path) -> u16 {
    let Ok(content) = std::fs::read_to_string(project_dir.join("package.json")) else {
        return DEFAULT_DEV_PORT;
    };
    let Ok(package) = serde_json::from_str::<serde_json::Value>(&content) else {
        return DEFAULT_DEV_PORT;
    };
    package
        .pointer("/scripts/dev")
        .and_then(serde_json::Value::as_str)
        .and_then(|script| DEV_PORT_RE.captures(script))
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(DEFAULT_DEV_PORT)
}

// ── Task composition ────────────────────────────────────────────────

/// Advisory sections prepended to the base template.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// Set while the tracker is treated as unreliable.
    pub degraded_reason: Option<String>,
    pub pending_operations: Vec<PendingOperation>,
    /// Reason the previous session's command was refused.
    pub last_blocked: Option<String>,
    pub recovery_notices: Vec<String>,
    /// Rendered work summary, when the tracker answered.
    pub work_summary: Option<String>,
    /// Why no work summary is available.
    pub tracker_unavailable: Option<String>,
}

impl TaskContext {
    pub fn is_empty(&self) -> bool {
        self.degraded_reason.is_none()
            && self.pending_operations.is_empty()
            && self.last_blocked.is_none()
            && self.recovery_notices.is_empty()
            && self.work_summary.is_none()
            && self.tracker_unavailable.is_none()
    }

    pub fn compose(&self, base: &str) -> String {
        let mut sections: Vec<String> = Vec::new();

        if let Some(reason) = &self.degraded_reason {
            sections.push(format!(
                "## DEGRADED MODE - ISSUE TRACKER UNRELIABLE\n\n\
                 Recent tracker calls failed ({reason}). Keep working on code, but do not \
                 depend on tracker writes succeeding. Record every status change or comment \
                 you cannot deliver in `.linear_pending.json` so a later session can replay it.\n\n\
                 Operations already pending: {}",
                self.pending_operations.len()
            ));
        } else if !self.pending_operations.is_empty() {
            let mut lines = vec![
                "## PENDING TRACKER UPDATES".to_string(),
                String::new(),
                "The tracker is reachable again. Apply these deferred updates before starting new work:"
                    .to_string(),
                String::new(),
            ];
            for op in &self.pending_operations {
                let params = serde_json::Value::Object(op.params.clone());
                lines.push(format!("- `{}` {} {}", op.issue_id, op.action, params));
            }
            sections.push(lines.join("\n"));
        }

        if let Some(reason) = &self.last_blocked {
            sections.push(format!(
                "## PREVIOUS COMMAND BLOCKED\n\n\
                 The security gate refused a command in the last session: {reason}\n\n\
                 Retrying it will fail again. Use an allowed command or a different approach."
            ));
        }

        sections.extend(self.recovery_notices.iter().cloned());

        if let Some(summary) = &self.work_summary {
            sections.push(format!("## CURRENT WORK STATUS\n\n{summary}"));
        } else if let Some(reason) = &self.tracker_unavailable {
            sections.push(format!(
                "## WORK STATUS UNAVAILABLE\n\n\
                 Could not load issue data before this session: {reason}\n\
                 Query the tracker yourself, and fall back to git history if it stays down."
            ));
        }

        if sections.is_empty() {
            return base.to_string();
        }
        sections.push("---".to_string());
        sections.push(base.to_string());
        sections.join("\n\n")
    }
}
