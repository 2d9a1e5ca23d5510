//! Per-session health counters
//!
//! A [`SessionHealth`] is created when a session starts, mutated only by that
//! session's activity/error callbacks, and folded into the autonomy history as
//! an immutable [`HealthSnapshot`] when the session ends.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::ErrorCategory;

/// Idle time after which a session is considered unhealthy.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(300);

/// Error-to-activity ratio above which a session is considered unhealthy.
const MAX_ERROR_RATE: f64 = 0.5;

/// Mutable health counters for one session.
#[derive(Debug, Clone)]
pub struct SessionHealth {
    started_at: DateTime<Utc>,
    start_time: Instant,
    last_activity: Instant,
    tool_calls: u32,
    errors: u32,
    failures: BTreeMap<ErrorCategory, u32>,
    items_worked: Vec<String>,
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHealth {
    /// Start tracking a new session now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started_at: Utc::now(),
            start_time: now,
            last_activity: now,
            tool_calls: 0,
            errors: 0,
            failures: BTreeMap::new(),
            items_worked: Vec::new(),
        }
    }

    /// An agent event arrived.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.tool_calls += 1;
    }

    /// A classified failure occurred inside the session.
    pub fn record_error(&mut self, category: ErrorCategory) {
        self.last_activity = Instant::now();
        self.errors += 1;
        *self.failures.entry(category).or_insert(0) += 1;
    }

    /// The session touched an externally tracked work item.
    pub fn record_item(&mut self, item_id: impl Into<String>) {
        let item_id = item_id.into();
        if !self.items_worked.contains(&item_id) {
            self.items_worked.push(item_id);
        }
    }

    pub fn tool_calls(&self) -> u32 {
        self.tool_calls
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Failures recorded for one category.
    pub fn failures(&self, category: ErrorCategory) -> u32 {
        self.failures.get(&category).copied().unwrap_or(0)
    }

    pub fn items_worked(&self) -> &[String] {
        &self.items_worked
    }

    /// Time since the last activity or error.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Errors per tool call (errors / max(1, tool_calls)).
    pub fn error_rate(&self) -> f64 {
        f64::from(self.errors) / f64::from(self.tool_calls.max(1))
    }

    /// Healthy unless idle longer than `max_idle` or erroring on more than
    /// half of its tool calls.
    pub fn is_healthy(&self, max_idle: Duration) -> bool {
        if self.idle_for() > max_idle {
            return false;
        }
        !(self.tool_calls > 0 && self.error_rate() > MAX_ERROR_RATE)
    }

    /// Immutable snapshot for the session history.
    pub fn summary(&self, max_idle: Duration) -> HealthSnapshot {
        HealthSnapshot {
            started_at: self.started_at,
            duration_secs: self.start_time.elapsed().as_secs_f64(),
            tool_calls: self.tool_calls,
            errors: self.errors,
            error_rate: self.error_rate(),
            failures: self.failures.clone(),
            items_worked: self.items_worked.clone(),
            is_healthy: self.is_healthy(max_idle),
        }
    }
}

/// Point-in-time health summary of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub tool_calls: u32,
    pub errors: u32,
    pub error_rate: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<ErrorCategory, u32>,
    #[serde(default)]
    pub items_worked: Vec<String>,
    pub is_healthy: bool,
}

impl HealthSnapshot {
    /// Failures recorded for one category.
    pub fn failures(&self, category: ErrorCategory) -> u32 {
        self.failures.get(&category).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_session_is_healthy() {
        let health = SessionHealth::new();
        assert!(health.is_healthy(DEFAULT_MAX_IDLE));
        assert_eq!(health.error_rate(), 0.0);
    }

    #[test]
    fn test_activity_and_errors_counted() {
        let mut health = SessionHealth::new();
        health.record_activity();
        health.record_activity();
        health.record_error(ErrorCategory::ExternalApi);
        health.record_error(ErrorCategory::PolicyBlocked);
        health.record_error(ErrorCategory::ExternalApi);

        assert_eq!(health.tool_calls(), 2);
        assert_eq!(health.errors(), 3);
        assert_eq!(health.failures(ErrorCategory::ExternalApi), 2);
        assert_eq!(health.failures(ErrorCategory::PolicyBlocked), 1);
        assert_eq!(health.failures(ErrorCategory::Auth), 0);
    }

    #[test]
    fn test_error_rate_threshold() {
        let mut health = SessionHealth::new();
        health.record_activity();
        health.record_activity();
        health.record_error(ErrorCategory::Transient);
        // exactly 0.5 is still healthy
        assert!(health.is_healthy(DEFAULT_MAX_IDLE));

        health.record_error(ErrorCategory::Transient);
        health.record_error(ErrorCategory::Transient);
        assert!(!health.is_healthy(DEFAULT_MAX_IDLE));
    }

    #[test]
    fn test_errors_without_tool_calls_stay_healthy() {
        let mut health = SessionHealth::new();
        health.record_error(ErrorCategory::Unknown);
        assert!(health.is_healthy(DEFAULT_MAX_IDLE));
    }

    #[test]
    fn test_idle_session_unhealthy() {
        let health = SessionHealth::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!health.is_healthy(Duration::from_millis(5)));
    }

    #[test]
    fn test_items_deduplicated_in_order() {
        let mut health = SessionHealth::new();
        health.record_item("COD-2");
        health.record_item("COD-1");
        health.record_item("COD-2");
        assert_eq!(health.items_worked(), ["COD-2", "COD-1"]);
    }

    #[test]
    fn test_summary_snapshot() {
        let mut health = SessionHealth::new();
        health.record_activity();
        health.record_error(ErrorCategory::BrowserAutomation);
        health.record_item("COD-7");

        let snapshot = health.summary(DEFAULT_MAX_IDLE);
        assert_eq!(snapshot.tool_calls, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.error_rate, 1.0);
        assert_eq!(snapshot.failures(ErrorCategory::BrowserAutomation), 1);
        assert_eq!(snapshot.items_worked, vec!["COD-7".to_string()]);
        assert!(!snapshot.is_healthy);

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: HealthSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
