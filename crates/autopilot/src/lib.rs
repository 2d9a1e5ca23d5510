//! Autopilot: unattended session loop for an autonomous coding agent
//!
//! Each iteration starts a fresh agent session with a task composed from a
//! template and the current tracker state, bounds it with a watchdog and a
//! hard deadline, classifies how it ended, and folds the result into
//! persistent [`autonomy::AutonomyState`].
//!
//! - [`orchestrator`]: the loop and its stop conditions
//! - [`session`]: one session under deadline
//! - [`runtime`]: agent process boundary (`claude -p` stream-json)
//! - [`tracker`]: Linear issue tracker with cache, marker file and pending journal
//! - [`prompts`]: task templates and advisory composition
//! - [`config`], [`cli`], [`telemetry`]: ambient plumbing

pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod prompts;
pub mod runtime;
pub mod session;
pub mod telemetry;
pub mod tracker;

pub use config::HarnessConfig;
pub use orchestrator::{ExitReason, Orchestrator, RunSummary, TaskSelector};
pub use runtime::{AgentRuntime, ClaudeCliRuntime, EventStream, SessionEvent};
pub use session::{run_session, SessionOutcome, SessionReport};
pub use tracker::{IssueTracker, LinearTracker, TrackerError, WorkSummary};
