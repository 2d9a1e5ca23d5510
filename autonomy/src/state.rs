//! Cross-session autonomy state
//!
//! [`AutonomyState`] is the only state that survives a restart. It tracks the
//! success/failure streaks, the bounded session history, degraded mode and an
//! optional pause deadline. The orchestrator owns it exclusively and persists
//! it after every session through a [`StateStore`].
//!
//! Pause policy:
//!
//! ```text
//! pause_until in the future            → (true, remaining)
//! consecutive_errors >= threshold      → (true, min(base * 2^(errors - threshold), max))
//! otherwise                            → (false, 0)
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classify::ErrorCategory;
use crate::error::{AutonomyError, AutonomyResult};
use crate::health::HealthSnapshot;

/// Default state file name inside the project directory.
pub const STATE_FILE_NAME: &str = ".autonomy_state.json";

/// Sessions shown in the status dashboard.
const STATUS_RECENT_SESSIONS: usize = 3;

/// Pause and history tuning. Supplied at construction, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseConfig {
    /// Consecutive failures before pausing.
    pub error_threshold: u32,
    /// Pause at exactly `error_threshold` failures.
    #[serde(with = "duration_secs")]
    pub base_pause: Duration,
    /// Pause cap.
    #[serde(with = "duration_secs")]
    pub max_pause: Duration,
    /// Session records kept in history.
    pub max_history: usize,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            base_pause: Duration::from_secs(30),
            max_pause: Duration::from_secs(600),
            max_history: 10,
        }
    }
}

impl PauseConfig {
    /// Pause for a given failure streak, or `None` below the threshold.
    pub fn pause_for(&self, consecutive_errors: u32) -> Option<Duration> {
        if self.error_threshold == 0 || consecutive_errors < self.error_threshold {
            return None;
        }
        let exponent = (consecutive_errors - self.error_threshold).min(31);
        let pause = self.base_pause.saturating_mul(1u32 << exponent);
        Some(pause.min(self.max_pause))
    }
}

/// Durations as whole seconds in TOML/JSON config.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// One finished session in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub health: HealthSnapshot,
}

/// Persistent cross-session autonomy state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyState {
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub total_sessions: u64,
    pub total_issues_completed: u64,
    pub degraded_mode: bool,
    /// Tracker failure that triggered degraded mode.
    pub degraded_reason: Option<String>,
    pub pause_until: Option<DateTime<Utc>>,
    pub last_error_category: Option<ErrorCategory>,
    pub last_error_message: Option<String>,
    pub session_history: VecDeque<SessionRecord>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip)]
    config: PauseConfig,
}

impl Default for AutonomyState {
    fn default() -> Self {
        Self::new(PauseConfig::default())
    }
}

impl AutonomyState {
    /// Fresh state with the given pause tuning.
    pub fn new(config: PauseConfig) -> Self {
        Self {
            consecutive_errors: 0,
            consecutive_successes: 0,
            total_sessions: 0,
            total_issues_completed: 0,
            degraded_mode: false,
            degraded_reason: None,
            pause_until: None,
            last_error_category: None,
            last_error_message: None,
            session_history: VecDeque::new(),
            last_updated: Utc::now(),
            config,
        }
    }

    pub fn config(&self) -> &PauseConfig {
        &self.config
    }

    /// Fold a finished session into the streaks and history.
    pub fn record_session_result(&mut self, success: bool, health: HealthSnapshot) {
        self.total_sessions += 1;
        self.total_issues_completed += health.items_worked.len() as u64;

        if success {
            self.consecutive_successes += 1;
            self.consecutive_errors = 0;
            self.last_error_category = None;
            self.last_error_message = None;
            if self.degraded_mode {
                self.exit_degraded_mode();
            }
        } else {
            self.consecutive_errors += 1;
            self.consecutive_successes = 0;
        }

        self.session_history.push_back(SessionRecord {
            success,
            timestamp: Utc::now(),
            health,
        });
        self.trim_history();
        self.last_updated = Utc::now();
    }

    /// Remember the last classified failure for the next task description.
    pub fn record_failure_cause(&mut self, category: ErrorCategory, message: impl Into<String>) {
        self.last_error_category = Some(category);
        self.last_error_message = Some(message.into());
        self.last_updated = Utc::now();
    }

    /// Whether to pause before the next session, and for how long.
    pub fn should_pause(&mut self) -> (bool, Duration) {
        self.should_pause_at(Utc::now())
    }

    /// [`Self::should_pause`] against an explicit clock.
    pub fn should_pause_at(&mut self, now: DateTime<Utc>) -> (bool, Duration) {
        if let Some(until) = self.pause_until {
            match (until - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => return (true, remaining),
                _ => self.pause_until = None,
            }
        }

        match self.config.pause_for(self.consecutive_errors) {
            Some(pause) => {
                self.pause_until = chrono::Duration::from_std(pause)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d));
                self.last_updated = now;
                (true, pause)
            }
            None => (false, Duration::ZERO),
        }
    }

    /// Switch to degraded mode. Advisory: the next task prompt changes.
    pub fn enter_degraded_mode(&mut self, reason: &str) {
        if !self.degraded_mode {
            warn!(reason, "entering degraded mode: issue tracker unreliable");
        }
        self.degraded_mode = true;
        self.degraded_reason = Some(reason.to_string());
        self.last_updated = Utc::now();
    }

    pub fn exit_degraded_mode(&mut self) {
        if self.degraded_mode {
            info!("exiting degraded mode");
        }
        self.degraded_mode = false;
        self.degraded_reason = None;
        self.last_updated = Utc::now();
    }

    /// Dashboard view.
    pub fn status(&self) -> AutonomyStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> AutonomyStatus {
        let pause_remaining = self
            .pause_until
            .and_then(|until| (until - now).to_std().ok())
            .filter(|d| !d.is_zero());
        let skip = self
            .session_history
            .len()
            .saturating_sub(STATUS_RECENT_SESSIONS);

        AutonomyStatus {
            total_sessions: self.total_sessions,
            total_issues_completed: self.total_issues_completed,
            consecutive_errors: self.consecutive_errors,
            consecutive_successes: self.consecutive_successes,
            degraded_mode: self.degraded_mode,
            degraded_reason: self.degraded_reason.clone(),
            paused: pause_remaining.is_some(),
            pause_remaining_secs: pause_remaining.map(|d| d.as_secs()).unwrap_or(0),
            last_error_category: self.last_error_category,
            last_error_message: self.last_error_message.clone(),
            recent_sessions: self.session_history.iter().skip(skip).cloned().collect(),
        }
    }

    /// Emit the dashboard as tracing events.
    pub fn log_status(&self) {
        let status = self.status();
        info!(
            sessions = status.total_sessions,
            issues_completed = status.total_issues_completed,
            consecutive_errors = status.consecutive_errors,
            consecutive_successes = status.consecutive_successes,
            degraded = status.degraded_mode,
            paused = status.paused,
            pause_remaining_secs = status.pause_remaining_secs,
            "autonomy status"
        );
        if let Some(category) = status.last_error_category {
            info!(
                category = %category,
                message = status.last_error_message.as_deref().unwrap_or(""),
                "last failure"
            );
        }
        for record in &status.recent_sessions {
            info!(
                at = %record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                success = record.success,
                tool_calls = record.health.tool_calls,
                errors = record.health.errors,
                duration_secs = record.health.duration_secs,
                "recent session"
            );
        }
    }

    fn trim_history(&mut self) {
        while self.session_history.len() > self.config.max_history {
            self.session_history.pop_front();
        }
    }
}

/// Serializable dashboard summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomyStatus {
    pub total_sessions: u64,
    pub total_issues_completed: u64,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub degraded_mode: bool,
    pub degraded_reason: Option<String>,
    pub paused: bool,
    pub pause_remaining_secs: u64,
    pub last_error_category: Option<ErrorCategory>,
    pub last_error_message: Option<String>,
    pub recent_sessions: Vec<SessionRecord>,
}

// ── Persistence ─────────────────────────────────────────────────────

/// JSON file store for [`AutonomyState`] with atomic replace.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default file name inside `project_dir`.
    pub fn in_project(project_dir: impl AsRef<Path>) -> Self {
        Self::new(project_dir.as_ref().join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state, never failing: a missing file gives fresh state and an
    /// unreadable or corrupt one gives fresh state plus a warning. An expired
    /// pause is cleared and history is trimmed to the configured bound.
    pub fn load(&self, config: PauseConfig) -> AutonomyState {
        match self.try_load(config) {
            Ok(Some(mut state)) => {
                if state
                    .pause_until
                    .is_some_and(|until| until <= Utc::now())
                {
                    state.pause_until = None;
                }
                state.trim_history();
                state
            }
            Ok(None) => AutonomyState::new(config),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "could not load autonomy state, starting fresh"
                );
                AutonomyState::new(config)
            }
        }
    }

    fn try_load(&self, config: PauseConfig) -> AutonomyResult<Option<AutonomyState>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Err(AutonomyError::invalid_state(&self.path, "file is empty"));
        }
        let mut state: AutonomyState = serde_json::from_str(&content)?;
        state.config = config;
        Ok(Some(state))
    }

    /// Write pretty JSON to `<path>.tmp`, then rename over the target.
    pub fn save(&self, state: &AutonomyState) -> AutonomyResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let content = serde_json::to_string_pretty(state)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
