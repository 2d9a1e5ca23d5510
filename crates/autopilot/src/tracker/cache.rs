//! Issue snapshot cache (`.linear_issue_cache.json`)
//!
//! Keeps the tracker off the hot path: a fresh cache is served as-is, an
//! expired one is only served when the API is down. The agent may also write
//! `invalidated_at` to force a refresh.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{write_json_atomic, IssueCounts, TrackedIssue, TrackerError};

pub const ISSUE_CACHE_FILE: &str = ".linear_issue_cache.json";

/// Default cache time-to-live.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(180);

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueCache {
    pub cache_version: u32,
    pub project_id: String,
    pub cached_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub invalidated_at: Option<DateTime<Utc>>,
    pub issues: Vec<TrackedIssue>,
    pub counts: IssueCounts,
}

impl IssueCache {
    pub fn new(project_id: impl Into<String>, issues: Vec<TrackedIssue>, ttl: Duration) -> Self {
        let counts = IssueCounts::from_issues(&issues);
        Self {
            cache_version: CACHE_VERSION,
            project_id: project_id.into(),
            cached_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
            invalidated_at: None,
            issues,
            counts,
        }
    }

    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(ISSUE_CACHE_FILE)
    }

    /// The cache, or `None` when missing or unreadable.
    pub fn load(project_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(Self::path(project_dir)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), TrackerError> {
        write_json_atomic(&Self::path(project_dir), self)
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.cached_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Usable without refetching: same project, not invalidated, within TTL.
    pub fn is_valid_at(&self, project_id: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.invalidated_at.is_none()
            && self.project_id == project_id
            && self.cached_at <= now
            && self.age_at(now) <= ttl
    }
}
