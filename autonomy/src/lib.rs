//! Autonomy: resilience primitives for unattended agent sessions
//!
//! This library provides:
//! - A closed failure taxonomy and keyword classifier ([`classify`])
//! - Per-category retry policies with exponential backoff ([`retry`])
//! - Per-session health counters ([`health`]) and a liveness [`watchdog`]
//! - Persistent cross-session state with pause and degraded-mode policy ([`state`])
//! - Stale in-progress work detection ([`stale`])
//! - An allowlist gate for agent shell commands ([`command_gate`])
//!
//! Everything here is independent of any particular agent runtime or issue
//! tracker; the `autopilot` crate wires these pieces into the session loop.

pub mod classify;
pub mod command_gate;
pub mod error;
pub mod health;
pub mod retry;
pub mod stale;
pub mod state;
pub mod watchdog;

pub use classify::{classify, ErrorCategory};
pub use command_gate::{CommandGate, GateDecision};
pub use error::{AutonomyError, AutonomyResult};
pub use health::{HealthSnapshot, SessionHealth, DEFAULT_MAX_IDLE};
pub use retry::{run_with_retry, run_with_retry_observed, RetryAttempt, RetryPolicies, RetryPolicy};
pub use stale::{StaleWorkDetector, DEFAULT_STALE_THRESHOLD};
pub use state::{AutonomyState, AutonomyStatus, PauseConfig, SessionRecord, StateStore};
pub use watchdog::{TimeoutCallback, Watchdog, WatchdogHandle, WatchdogState};
