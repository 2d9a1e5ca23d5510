//! Deferred tracker writes (`.linear_pending.json`)
//!
//! While the tracker is unreliable, status changes and comments are journaled
//! here and replayed by a later session once the API is back.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{write_json_atomic, TrackerError};

pub const PENDING_FILE: &str = ".linear_pending.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub issue_id: String,
    pub action: String,
    pub added_at: DateTime<Utc>,
    /// Action-specific parameters (`status`, `body`, ...).
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingOperations {
    pub pending_updates: Vec<PendingOperation>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_cleared: Option<DateTime<Utc>>,
    pub last_cleared_count: Option<usize>,
}

/// File-backed journal of pending operations.
#[derive(Debug, Clone)]
pub struct PendingJournal {
    path: PathBuf,
}

impl PendingJournal {
    pub fn in_project(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join(PENDING_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current journal; empty when missing, empty with a warning when corrupt.
    pub fn load(&self) -> PendingOperations {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return PendingOperations::default(),
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "pending journal unreadable, ignoring");
            PendingOperations::default()
        })
    }

    fn save(&self, mut pending: PendingOperations) -> Result<(), TrackerError> {
        let now = Utc::now();
        pending.updated_at = Some(now);
        pending.created_at.get_or_insert(now);
        write_json_atomic(&self.path, &pending)
    }

    /// Append one operation. Non-object `params` are stored under `value`.
    pub fn add(
        &self,
        issue_id: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<(), TrackerError> {
        let params = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut pending = self.load();
        pending.pending_updates.push(PendingOperation {
            issue_id: issue_id.to_string(),
            action: action.to_string(),
            added_at: Utc::now(),
            params,
        });
        self.save(pending)
    }

    pub fn count(&self) -> usize {
        self.load().pending_updates.len()
    }

    /// Drop all pending operations after replay. Returns how many were cleared.
    pub fn clear(&self) -> Result<usize, TrackerError> {
        let mut pending = self.load();
        let count = pending.pending_updates.len();
        if count > 0 {
            pending.pending_updates.clear();
            pending.last_cleared = Some(Utc::now());
            pending.last_cleared_count = Some(count);
            self.save(pending)?;
        }
        Ok(count)
    }
}
