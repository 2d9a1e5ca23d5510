//! Stale in-progress work detection
//!
//! A tracker item left "in progress" by a crashed or abandoned session shows
//! up with an old `updated_at`. Once that is older than the threshold the next
//! session is told to resolve it before starting anything new.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Default age after which in-progress work counts as abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// Naive ISO-8601 layouts accepted when no offset is given.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleWorkDetector {
    threshold: Duration,
}

impl Default for StaleWorkDetector {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_THRESHOLD)
    }
}

impl StaleWorkDetector {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Whether an item last updated at `last_updated` is stale now.
    pub fn is_stale(&self, last_updated: &str) -> bool {
        self.is_stale_at(last_updated, Utc::now())
    }

    /// Stale when strictly older than the threshold. Unparsable timestamps
    /// are never stale.
    pub fn is_stale_at(&self, last_updated: &str, now: DateTime<Utc>) -> bool {
        let Some(updated) = parse_timestamp(last_updated) else {
            return false;
        };
        match (now - updated).to_std() {
            Ok(age) => age > self.threshold,
            // timestamp in the future
            Err(_) => false,
        }
    }

    /// Markdown section telling the next session to resolve `id` first.
    pub fn recovery_notice(&self, id: &str, title: &str) -> String {
        let hours = self.threshold.as_secs() / 3600;
        let age = if hours > 0 {
            format!("{hours} hours")
        } else {
            format!("{} minutes", self.threshold.as_secs() / 60)
        };

        format!(
            "\n## STALE WORK DETECTED - RECOVERY REQUIRED\n\n\
             Issue `{id}` (\"{title}\") has been \"In Progress\" for over {age}.\n\
             A previous session probably crashed or was interrupted.\n\n\
             **Your first priority:**\n\
             1. Read the issue comments for notes on partial work\n\
             2. Check git log for commits made for this issue\n\
             3. Assess the current state of the implementation\n\
             4. Either:\n   \
             a. finish the remaining work and mark it Done, or\n   \
             b. comment with exactly what is missing and leave it In Progress\n\n\
             Do NOT start new issues until this one is resolved.\n"
        )
    }
}

/// RFC 3339 (`Z` or offset) or naive ISO-8601, the latter taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_three_hours_old_is_stale() {
        let detector = StaleWorkDetector::default();
        assert!(detector.is_stale_at("2025-03-14T09:00:00Z", now()));
        assert!(detector.is_stale_at("2025-03-14T09:00:00.000+00:00", now()));
    }

    #[test]
    fn test_recent_is_not_stale() {
        let detector = StaleWorkDetector::default();
        assert!(!detector.is_stale_at("2025-03-14T11:00:00Z", now()));
        // exactly at the threshold
        assert!(!detector.is_stale_at("2025-03-14T10:00:00Z", now()));
    }

    #[test]
    fn test_offset_is_respected() {
        let detector = StaleWorkDetector::default();
        // 11:30 at +02:00 is 09:30 UTC
        assert!(detector.is_stale_at("2025-03-14T11:30:00+02:00", now()));
    }

    #[test]
    fn test_naive_timestamps_are_utc() {
        let detector = StaleWorkDetector::default();
        assert!(detector.is_stale_at("2025-03-14T09:00:00", now()));
        assert!(detector.is_stale_at("2025-03-14 09:00:00.250", now()));
        assert!(!detector.is_stale_at("2025-03-14T11:59:00", now()));
    }

    #[test]
    fn test_unparsable_fails_open() {
        let detector = StaleWorkDetector::default();
        for raw in ["", "yesterday", "2025-13-40T99:00:00Z", "1710000000"] {
            assert!(!detector.is_stale_at(raw, now()), "{raw}");
        }
    }

    #[test]
    fn test_future_timestamp_not_stale() {
        let detector = StaleWorkDetector::default();
        assert!(!detector.is_stale_at("2025-03-15T12:00:00Z", now()));
    }

    #[test]
    fn test_custom_threshold() {
        let detector = StaleWorkDetector::new(Duration::from_secs(30 * 60));
        assert!(detector.is_stale_at("2025-03-14T11:00:00Z", now()));
        assert!(detector
            .recovery_notice("COD-1", "Login")
            .contains("over 30 minutes"));
    }

    #[test]
    fn test_recovery_notice_names_item() {
        let notice = StaleWorkDetector::default().recovery_notice("COD-42", "Add login form");
        assert!(notice.contains("## STALE WORK DETECTED"));
        assert!(notice.contains("`COD-42`"));
        assert!(notice.contains("\"Add login form\""));
        assert!(notice.contains("over 2 hours"));
        assert!(notice.contains("Do NOT start new issues"));
    }
}
