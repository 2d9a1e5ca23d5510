//! Failure classification
//!
//! Maps the text of a failure (an error message, a tool result, an agent
//! response) to exactly one [`ErrorCategory`]. Retry, pause and stop decisions
//! are all driven by the category, never by the raw text.
//!
//! Matching is case-insensitive substring search over an ordered keyword
//! table; the first category with a hit wins:
//!
//! ```text
//! auth → rate_limit → external_api → browser_automation
//!      → resource → policy_blocked → transient → unknown
//! ```

use serde::{Deserialize, Serialize};

/// Closed taxonomy of session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blips and 5xx gateways. Retried quickly.
    Transient,
    /// API rate limiting. Backs off significantly.
    RateLimit,
    /// Credentials rejected or expired. Fatal for the run.
    Auth,
    /// Memory, context or turn budget exhausted.
    Resource,
    /// Issue-tracker failures. The run continues degraded.
    ExternalApi,
    /// Browser automation failures.
    BrowserAutomation,
    /// A command was refused by the security gate.
    PolicyBlocked,
    /// Nothing matched.
    Unknown,
}

impl ErrorCategory {
    /// Every category, in classification order.
    pub const ALL: [ErrorCategory; 8] = [
        Self::Auth,
        Self::RateLimit,
        Self::ExternalApi,
        Self::BrowserAutomation,
        Self::Resource,
        Self::PolicyBlocked,
        Self::Transient,
        Self::Unknown,
    ];

    /// Whether this category ends the run outright.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Auth)
    }

    /// Whether the default retry table retries this category at all. For a
    /// customised table use [`RetryPolicies::is_retriable`].
    ///
    /// [`RetryPolicies::is_retriable`]: crate::retry::RetryPolicies::is_retriable
    pub fn is_retriable(self) -> bool {
        !matches!(self, Self::PolicyBlocked)
    }

    /// Short operator-facing hint for log lines.
    pub fn advice(self) -> &'static str {
        match self {
            Self::Transient => "retrying shortly",
            Self::RateLimit => "backing off for the rate limit window",
            Self::Auth => "check credentials; retrying will not help",
            Self::Resource => "starting a fresh session",
            Self::ExternalApi => "issue tracker unreliable, continuing degraded",
            Self::BrowserAutomation => "browser automation failed, may need a restart",
            Self::PolicyBlocked => "command refused; next task must change approach",
            Self::Unknown => "retrying conservatively",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Auth => write!(f, "auth"),
            Self::Resource => write!(f, "resource"),
            Self::ExternalApi => write!(f, "external_api"),
            Self::BrowserAutomation => write!(f, "browser_automation"),
            Self::PolicyBlocked => write!(f, "policy_blocked"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Ordered keyword table. Order matters: "401 rate limit" is auth.
const KEYWORD_TABLE: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Auth,
        &[
            "unauthorized",
            "401",
            "authentication",
            "invalid token",
            "expired token",
        ],
    ),
    (
        ErrorCategory::RateLimit,
        &["rate limit", "429", "too many requests", "throttl"],
    ),
    (
        ErrorCategory::ExternalApi,
        &["linear", "mcp__linear", "graphql"],
    ),
    (
        ErrorCategory::BrowserAutomation,
        &[
            "puppeteer",
            "browser",
            "chrome",
            "timeout waiting for",
            "navigation",
        ],
    ),
    (
        ErrorCategory::Resource,
        &["out of memory", "context", "max_turns", "resource"],
    ),
    (
        ErrorCategory::PolicyBlocked,
        &["blocked", "not allowed", "permission denied", "security"],
    ),
    (
        ErrorCategory::Transient,
        &[
            "timeout",
            "connection",
            "network",
            "temporary",
            "econnreset",
            "503",
            "502",
        ],
    ),
];

/// Classify a failure by its text. Total: every input maps to a category.
pub fn classify(text: &str) -> ErrorCategory {
    let lower = text.to_lowercase();

    KEYWORD_TABLE
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}
