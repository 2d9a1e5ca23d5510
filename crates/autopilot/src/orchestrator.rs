//! Session loop.
//!
//! ```text
//! Init ──► ┌─ MaybePause ─► RunSession ─► ClassifyOutcome ─► UpdateState ─┐
//!          │                                                             │
//!          └──────────── MaybeDelay ◄──────────── MaybeStop ◄────────────┘
//!                                                    │
//!                                                    ▼
//!                                                   Done
//! ```
//!
//! Session failures never escape `run()`: they are classified, recorded, and
//! turned into the next iteration's pause, degraded-mode notice, or stop.
//! Once the cancellation token fires the loop exits without writing state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autonomy::{
    AutonomyState, ErrorCategory, SessionHealth, StaleWorkDetector, StateStore, TimeoutCallback,
    Watchdog,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::prompts::{detect_dev_port, PromptLibrary, TaskContext, TaskKind};
use crate::runtime::AgentRuntime;
use crate::session::{run_session, SessionOutcome};
use crate::telemetry::format_duration;
use crate::tracker::{IssueTracker, TrackerError};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    MaxIterations,
    AuthFailure,
    ProjectComplete,
    Cancelled,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxIterations => write!(f, "max_iterations"),
            Self::AuthFailure => write!(f, "auth_failure"),
            Self::ProjectComplete => write!(f, "project_complete"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Sessions started.
    pub iterations: u32,
    pub exit_reason: ExitReason,
    pub state: AutonomyState,
}

/// Picks the template for each session.
///
/// A one-shot task (add-spec, add-features) runs exactly once, first. A fresh
/// project gets one initializer session. Everything after is `Continue`.
#[derive(Debug, Clone)]
pub struct TaskSelector {
    one_shot: Option<TaskKind>,
    needs_initialize: bool,
}

impl TaskSelector {
    pub fn new(initialized: bool) -> Self {
        Self {
            one_shot: None,
            needs_initialize: !initialized,
        }
    }

    pub fn with_one_shot(mut self, kind: TaskKind) -> Self {
        self.one_shot = Some(kind);
        self
    }

    pub fn next_task(&mut self) -> TaskKind {
        if let Some(kind) = self.one_shot.take() {
            return kind;
        }
        if self.needs_initialize {
            self.needs_initialize = false;
            return TaskKind::Initialize;
        }
        TaskKind::Continue
    }
}

pub struct Orchestrator {
    config: HarnessConfig,
    runtime: Arc<dyn AgentRuntime>,
    tracker: Arc<dyn IssueTracker>,
    prompts: PromptLibrary,
    store: StateStore,
    state: AutonomyState,
    selector: TaskSelector,
    detector: StaleWorkDetector,
    cancel: CancellationToken,
    echo: bool,
    last_blocked: Option<String>,
}

impl Orchestrator {
    /// Loads persisted state from `store`; a missing or corrupt file starts fresh.
    pub fn new(
        config: HarnessConfig,
        runtime: Arc<dyn AgentRuntime>,
        tracker: Arc<dyn IssueTracker>,
        prompts: PromptLibrary,
        store: StateStore,
        cancel: CancellationToken,
    ) -> Self {
        let state = store.load(config.pause);
        let selector = TaskSelector::new(tracker.is_initialized());
        Self {
            config,
            runtime,
            tracker,
            prompts,
            store,
            state,
            selector,
            detector: StaleWorkDetector::default(),
            cancel,
            echo: false,
            last_blocked: None,
        }
    }

    pub fn with_task_selector(mut self, selector: TaskSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Mirror agent text to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn state(&self) -> &AutonomyState {
        &self.state
    }

    pub async fn run(mut self) -> Result<RunSummary> {
        self.store
            .save(&self.state)
            .with_context(|| format!("writing autonomy state to {}", self.store.path().display()))?;
        self.state.log_status();

        let mut iteration: u32 = 0;
        let exit_reason = loop {
            if self.cancel.is_cancelled() {
                break ExitReason::Cancelled;
            }
            if let Some(max) = self.config.max_iterations {
                if iteration >= max {
                    info!(max_iterations = max, "reached max iterations");
                    break ExitReason::MaxIterations;
                }
            }

            // 1. pause after a failure streak
            let (pause, remaining) = self.state.should_pause();
            if pause {
                warn!(
                    consecutive_errors = self.state.consecutive_errors,
                    pause = %format_duration(remaining),
                    "pausing after repeated failures"
                );
                self.persist();
                if !self.sleep_or_cancel(remaining).await {
                    break ExitReason::Cancelled;
                }
                self.state.pause_until = None;
            }

            iteration += 1;

            // 2. task
            let kind = self.selector.next_task();
            let (task, replayed) = self.compose_task(&kind).await;
            info!(iteration, task = %kind, degraded = self.state.degraded_mode, "starting session");

            // 3-4. session under watchdog and deadline
            let mut health = SessionHealth::new();
            let on_timeout: TimeoutCallback = Arc::new(|idle: Duration| {
                warn!(idle_secs = idle.as_secs(), "agent may be stuck; session deadline still applies");
            });
            let mut watchdog = Watchdog::new(self.config.watchdog_timeout, Some(on_timeout));
            watchdog.start();
            let handle = watchdog.handle();

            let report = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                report = run_session(
                    Arc::clone(&self.runtime),
                    &task,
                    &mut health,
                    &handle,
                    self.config.session_timeout,
                    self.echo,
                ) => Some(report),
            };
            watchdog.stop().await;
            let Some(report) = report else {
                info!(iteration, "cancelled during session");
                break ExitReason::Cancelled;
            };

            // 5. fold into persistent state
            let outcome = report.outcome;
            self.state
                .record_session_result(outcome.is_success(), health.summary(self.config.max_idle));
            if let (Some(category), Some(message)) =
                (outcome.failure_category(), outcome.failure_message())
            {
                warn!(%category, advice = category.advice(), "session {}", outcome.label());
                self.state.record_failure_cause(category, message);
            }
            self.last_blocked = match outcome.failure_category() {
                Some(ErrorCategory::PolicyBlocked) => outcome.failure_message(),
                _ => report.last_blocked,
            };
            self.persist();

            // 6-8. stop or degrade
            match &outcome {
                SessionOutcome::Continue { .. } => {
                    if replayed > 0 {
                        match self.tracker.clear_pending() {
                            Ok(cleared) => info!(cleared, "pending tracker operations replayed"),
                            Err(e) => warn!(error = %e, "could not clear pending tracker operations"),
                        }
                    }
                    if self.config.auto_stop {
                        match self.tracker.report_completion().await {
                            Ok(true) => {
                                info!("all tracked issues are done, stopping");
                                break ExitReason::ProjectComplete;
                            }
                            Ok(false) => {}
                            Err(e) => warn!(error = %e, "could not check completion"),
                        }
                    }
                }
                SessionOutcome::Error {
                    category: ErrorCategory::Auth,
                    message,
                } => {
                    error!(error = %message, "authentication failure, stopping");
                    break ExitReason::AuthFailure;
                }
                SessionOutcome::Error {
                    category: ErrorCategory::ExternalApi,
                    message,
                } => {
                    self.state.enter_degraded_mode(message);
                    self.persist();
                }
                _ => {}
            }

            // 9. next session
            if !self.config.continuous {
                info!(delay = %format_duration(self.config.auto_continue_delay), "next session after delay");
                if !self.sleep_or_cancel(self.config.auto_continue_delay).await {
                    break ExitReason::Cancelled;
                }
            }
        };

        info!(iterations = iteration, reason = %exit_reason, "session loop finished");
        self.state.log_status();
        Ok(RunSummary {
            iterations: iteration,
            exit_reason,
            state: self.state,
        })
    }

    /// Build the task text. Returns it with the number of pending operations
    /// listed for replay.
    async fn compose_task(&mut self, kind: &TaskKind) -> (String, usize) {
        let base = self
            .prompts
            .render(kind, detect_dev_port(&self.config.project_dir));
        let mut context = TaskContext {
            last_blocked: self.last_blocked.clone(),
            ..TaskContext::default()
        };

        if *kind != TaskKind::Initialize {
            match self.tracker.get_work_summary().await {
                Ok(summary) => {
                    context.recovery_notices = summary
                        .stale_items
                        .iter()
                        .map(|item| self.detector.recovery_notice(&item.identifier, &item.title))
                        .collect();
                    context.work_summary = Some(summary.render_markdown());
                }
                Err(TrackerError::NotInitialized(dir)) => {
                    debug!(dir, "tracker project not initialized yet");
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(error = %message, "work summary unavailable");
                    self.state.enter_degraded_mode(&message);
                    self.persist();
                    context.tracker_unavailable = Some(message);
                }
            }
        }

        context.pending_operations = self.tracker.pending_operations();
        if self.state.degraded_mode {
            context.degraded_reason = Some(
                self.state
                    .degraded_reason
                    .clone()
                    .or_else(|| context.tracker_unavailable.clone())
                    .unwrap_or_else(|| "tracker errors".to_string()),
            );
        }
        let replayed = if context.degraded_reason.is_none() {
            context.pending_operations.len()
        } else {
            0
        };
        (context.compose(&base), replayed)
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn persist(&self) {
        if self.cancel.is_cancelled() {
            debug!("cancellation in progress, not writing state");
            return;
        }
        if let Err(e) = self.store.save(&self.state) {
            warn!(error = %e, path = %self.store.path().display(), "failed to persist autonomy state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::{Script, ScriptedRuntime};
    use crate::runtime::SessionEvent;
    use crate::tracker::{PendingOperation, WorkSummary};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Tracker fake: scripted summaries and completion answers.
    struct FakeTracker {
        initialized: bool,
        summaries: Mutex<VecDeque<Result<WorkSummary, TrackerError>>>,
        complete_after: Option<u32>,
        completion_checks: Mutex<u32>,
        pending: Mutex<Vec<PendingOperation>>,
    }

    impl FakeTracker {
        fn new() -> Self {
            Self {
                initialized: true,
                summaries: Mutex::new(VecDeque::new()),
                complete_after: None,
                completion_checks: Mutex::new(0),
                pending: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IssueTracker for FakeTracker {
        async fn get_work_summary(&self) -> Result<WorkSummary, TrackerError> {
            self.summaries
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(WorkSummary::default()))
        }

        async fn report_completion(&self) -> Result<bool, TrackerError> {
            let mut checks = self.completion_checks.lock().unwrap();
            *checks += 1;
            Ok(self.complete_after.is_some_and(|n| *checks >= n))
        }

        async fn queue_pending_operation(
            &self,
            item_id: &str,
            action: &str,
            _params: serde_json::Value,
        ) -> Result<(), TrackerError> {
            self.pending.lock().unwrap().push(PendingOperation {
                issue_id: item_id.to_string(),
                action: action.to_string(),
                added_at: chrono::Utc::now(),
                params: serde_json::Map::new(),
            });
            Ok(())
        }

        fn pending_count(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        fn pending_operations(&self) -> Vec<PendingOperation> {
            self.pending.lock().unwrap().clone()
        }

        fn clear_pending(&self) -> Result<usize, TrackerError> {
            Ok(std::mem::take(&mut *self.pending.lock().unwrap()).len())
        }

        fn is_initialized(&self) -> bool {
            self.initialized
        }
    }

    fn text(s: &str) -> Script {
        Script::Events(vec![Ok(SessionEvent::Text(s.to_string()))])
    }

    fn failing(message: &str) -> Script {
        Script::Events(vec![Err(message.to_string())])
    }

    fn config(dir: &TempDir, max_iterations: Option<u32>) -> HarnessConfig {
        HarnessConfig {
            project_dir: dir.path().to_path_buf(),
            max_iterations,
            state_file: dir.path().join(autonomy::state::STATE_FILE_NAME),
            ..HarnessConfig::default()
        }
    }

    fn orchestrator(
        dir: &TempDir,
        max_iterations: Option<u32>,
        runtime: Arc<ScriptedRuntime>,
        tracker: Arc<FakeTracker>,
    ) -> Orchestrator {
        Orchestrator::new(
            config(dir, max_iterations),
            runtime,
            tracker,
            PromptLibrary::builtin(),
            StateStore::in_project(dir.path()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_task_selector_one_shot_then_initialize_then_continue() {
        let mut selector =
            TaskSelector::new(false).with_one_shot(TaskKind::AddSpec("extra.txt".into()));
        assert_eq!(selector.next_task(), TaskKind::AddSpec("extra.txt".into()));
        assert_eq!(selector.next_task(), TaskKind::Initialize);
        assert_eq!(selector.next_task(), TaskKind::Continue);
        assert_eq!(selector.next_task(), TaskKind::Continue);

        let mut initialized = TaskSelector::new(true);
        assert_eq!(initialized.next_task(), TaskKind::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![text("a"), text("b"), text("c")]));
        let summary = orchestrator(&dir, Some(2), runtime.clone(), Arc::new(FakeTracker::new()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.exit_reason, ExitReason::MaxIterations);
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.state.total_sessions, 2);
        assert_eq!(summary.state.consecutive_successes, 2);
        assert_eq!(runtime.tasks().len(), 2);

        let persisted = StateStore::in_project(dir.path()).load(Default::default());
        assert_eq!(persisted.total_sessions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_iterations_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let summary = orchestrator(&dir, Some(0), runtime.clone(), Arc::new(FakeTracker::new()))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.exit_reason, ExitReason::MaxIterations);
        assert_eq!(summary.iterations, 0);
        assert!(runtime.tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            failing("Invalid token: 401 Unauthorized"),
            text("never runs"),
        ]));
        let summary = orchestrator(&dir, Some(5), runtime.clone(), Arc::new(FakeTracker::new()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.exit_reason, ExitReason::AuthFailure);
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.state.last_error_category, Some(ErrorCategory::Auth));
        assert_eq!(runtime.tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_api_failure_enters_degraded_mode() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            failing("mcp__linear__list_issues failed: 502"),
            text("worked around it"),
        ]));
        let tracker = Arc::new(FakeTracker::new());
        let summary = orchestrator(&dir, Some(2), runtime.clone(), tracker)
            .run()
            .await
            .unwrap();

        let tasks = runtime.tasks();
        assert!(!tasks[0].contains("DEGRADED MODE"));
        assert!(tasks[1].contains("DEGRADED MODE"));
        // the second session succeeded, which clears degraded mode
        assert!(!summary.state.degraded_mode);
        assert_eq!(summary.state.consecutive_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_failure_while_composing_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![text("ok")]));
        let tracker = FakeTracker::new();
        tracker
            .summaries
            .lock()
            .unwrap()
            .push_back(Err(TrackerError::Graphql("rate exceeded".into())));
        let summary = orchestrator(&dir, Some(1), runtime.clone(), Arc::new(tracker))
            .run()
            .await
            .unwrap();

        let task = &runtime.tasks()[0];
        assert!(task.contains("DEGRADED MODE"));
        assert!(task.contains("## WORK STATUS UNAVAILABLE"));
        assert_eq!(summary.exit_reason, ExitReason::MaxIterations);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_project_complete() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let tracker = FakeTracker {
            complete_after: Some(2),
            ..FakeTracker::new()
        };
        let summary = orchestrator(&dir, None, runtime, Arc::new(tracker))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.exit_reason, ExitReason::ProjectComplete);
        assert_eq!(summary.iterations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![Script::Hang]));
        let summary = orchestrator(&dir, Some(1), runtime, Arc::new(FakeTracker::new()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.state.consecutive_errors, 1);
        assert_eq!(summary.state.last_error_category, Some(ErrorCategory::Transient));
        assert!(summary
            .state
            .last_error_message
            .as_deref()
            .unwrap()
            .contains("session timeout"));
        assert!(!summary.state.session_history[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_streak_pauses_before_next_session() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = (0..6).map(|_| failing("connection reset")).collect();
        let runtime = Arc::new(ScriptedRuntime::new(scripts));
        let start = tokio::time::Instant::now();
        let summary = orchestrator(&dir, Some(6), runtime, Arc::new(FakeTracker::new()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.state.consecutive_errors, 6);
        // one 30s pause before the sixth session
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_task_used_once_and_blocked_reason_carried() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            Script::Events(vec![Ok(SessionEvent::ToolResult {
                content: "Command 'wget' is not in the allowed commands list (blocked)".into(),
                is_error: true,
            })]),
            text("ok"),
        ]));
        let summary = orchestrator(&dir, Some(2), runtime.clone(), Arc::new(FakeTracker::new()))
            .with_task_selector(TaskSelector::new(true).with_one_shot(TaskKind::AddFeatures))
            .run()
            .await
            .unwrap();

        let tasks = runtime.tasks();
        assert!(tasks[0].contains("FEATURE PLANNING AGENT"));
        assert!(tasks[1].contains("CODING AGENT"));
        assert!(tasks[1].contains("PREVIOUS COMMAND BLOCKED"));
        assert!(tasks[1].contains("'wget'"));
        assert_eq!(summary.iterations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_blocked_session_error_reaches_next_task() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            failing("Command 'rm -rf' is not allowed by policy"),
            text("ok"),
        ]));
        let summary = orchestrator(&dir, Some(2), runtime.clone(), Arc::new(FakeTracker::new()))
            .run()
            .await
            .unwrap();

        let tasks = runtime.tasks();
        assert!(!tasks[0].contains("PREVIOUS COMMAND BLOCKED"));
        assert!(tasks[1].contains("PREVIOUS COMMAND BLOCKED"));
        assert!(tasks[1].contains("'rm -rf'"));
        assert_eq!(summary.state.session_history.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_notice_keeps_tracker_reason() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            failing("mcp__linear__list_issues failed: 502"),
            failing("connection reset by peer"),
            text("ok"),
        ]));
        orchestrator(&dir, Some(3), runtime.clone(), Arc::new(FakeTracker::new()))
            .run()
            .await
            .unwrap();

        let task = &runtime.tasks()[2];
        assert!(task.contains("DEGRADED MODE"));
        assert!(task.contains("(mcp__linear__list_issues failed: 502)"));
        assert!(!task.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_deadline_persisted_before_sleeping() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let scripts = (0..5).map(|_| failing("connection reset")).collect();
        let orchestrator = Orchestrator::new(
            config(&dir, None),
            Arc::new(ScriptedRuntime::new(scripts)),
            Arc::new(FakeTracker::new()),
            PromptLibrary::builtin(),
            StateStore::in_project(dir.path()),
            cancel.clone(),
        );

        let run = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_secs(10)).await;

        let persisted = StateStore::in_project(dir.path()).load(Default::default());
        assert_eq!(persisted.consecutive_errors, 5);
        assert!(persisted.pause_until.is_some());

        cancel.cancel();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.exit_reason, ExitReason::Cancelled);
        assert_eq!(summary.iterations, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_operations_replayed_then_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(FakeTracker::new());
        tracker
            .queue_pending_operation("COD-9", "update_status", serde_json::Value::Null)
            .await
            .unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(vec![text("replayed")]));
        orchestrator(&dir, Some(1), runtime.clone(), tracker.clone())
            .run()
            .await
            .unwrap();

        assert!(runtime.tasks()[0].contains("## PENDING TRACKER UPDATES"));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_session_skips_state_write() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runtime = Arc::new(ScriptedRuntime::new(vec![Script::Hang]));
        let orchestrator = Orchestrator::new(
            config(&dir, None),
            runtime,
            Arc::new(FakeTracker::new()),
            PromptLibrary::builtin(),
            StateStore::in_project(dir.path()),
            cancel.clone(),
        );

        let run = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        let summary = run.await.unwrap().unwrap();

        assert_eq!(summary.exit_reason, ExitReason::Cancelled);
        assert_eq!(summary.iterations, 1);
        let persisted = StateStore::in_project(dir.path()).load(Default::default());
        assert_eq!(persisted.total_sessions, 0);
    }
}
