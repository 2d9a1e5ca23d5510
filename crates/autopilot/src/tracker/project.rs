//! Local project marker (`.linear_project.json`)
//!
//! Written by the initializer session once the tracker project exists. Its
//! presence with `initialized: true` is what distinguishes a fresh project
//! from a continuing one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{write_json_atomic, IssueCounts, TrackerError};

pub const PROJECT_MARKER_FILE: &str = ".linear_project.json";

/// Issue counts below this look like an incomplete initialization.
const MIN_EXPECTED_ISSUES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCounts {
    pub done: u32,
    pub in_progress: u32,
    pub todo: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMarker {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub meta_issue_id: Option<String>,
    #[serde(default)]
    pub total_issues: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_counts: Option<CachedCounts>,
    /// Fields written by the agent that we carry through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProjectMarker {
    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(PROJECT_MARKER_FILE)
    }

    /// The marker, or `None` when missing or unreadable.
    pub fn load(project_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(Self::path(project_dir)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn is_initialized(project_dir: &Path) -> bool {
        Self::load(project_dir).is_some_and(|m| m.initialized)
    }

    /// Local consistency warnings; empty when the marker looks healthy.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.initialized {
            warnings.push("project marked as not initialized".to_string());
        }

        if self.total_issues == 0 {
            warnings.push("no issues recorded (total_issues = 0)".to_string());
        } else if self.total_issues < MIN_EXPECTED_ISSUES {
            warnings.push(format!("unusually low issue count: {}", self.total_issues));
        }

        let required = [
            ("team_id", &self.team_id),
            ("project_id", &self.project_id),
            ("meta_issue_id", &self.meta_issue_id),
        ];
        for (field, value) in required {
            if value.as_deref().map_or(true, str::is_empty) {
                warnings.push(format!("missing {field}"));
            }
        }

        warnings
    }

    /// Record the latest counts back into the marker file.
    pub fn store_counts(
        &mut self,
        project_dir: &Path,
        counts: &IssueCounts,
    ) -> Result<(), TrackerError> {
        self.cached_counts = Some(CachedCounts {
            done: counts.done,
            in_progress: counts.in_progress,
            todo: counts.todo,
            updated_at: Utc::now(),
        });
        write_json_atomic(&Self::path(project_dir), self)
    }
}

/// Marker validation result for a project directory.
pub fn validate_project_state(project_dir: &Path) -> Vec<String> {
    match ProjectMarker::load(project_dir) {
        Some(marker) => marker.validate(),
        None => vec![format!("no {PROJECT_MARKER_FILE} found")],
    }
}
