//! Liveness watchdog for a running session
//!
//! The watchdog owns one background tokio task that wakes every poll interval
//! and compares the time since the last [`WatchdogHandle::pet`] against the
//! timeout. A breach invokes the registered callback exactly once and resets
//! the clock, so a session that stays hung re-triggers after another full
//! timeout rather than on every poll.
//!
//! ```text
//! Stopped ──start()──→ Running ──stop().await──→ Stopped
//!                        │
//!                        └─ every poll: since_pet > timeout → on_timeout(elapsed); pet()
//! ```
//!
//! The watchdog only reports. Cancelling the session is the job of the
//! wall-clock deadline that wraps the whole session call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on the poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Lower bound on the poll interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callback invoked with the observed silence when the timeout is breached.
pub type TimeoutCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Lifecycle of a [`Watchdog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Stopped,
    Running,
}

/// Last-pet timestamp shared between the session path and the monitor task.
#[derive(Debug)]
struct PetClock {
    epoch: Instant,
    last_pet_ms: AtomicU64,
}

impl PetClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_pet_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn pet(&self) {
        self.last_pet_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn since_pet(&self) -> Duration {
        let last = self.last_pet_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

/// Cheap, cloneable handle used by the session path to signal activity.
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    clock: Arc<PetClock>,
}

impl WatchdogHandle {
    /// Record activity now.
    pub fn pet(&self) {
        self.clock.pet();
    }

    /// Time since the last pet.
    pub fn since_pet(&self) -> Duration {
        self.clock.since_pet()
    }
}

/// Background liveness timer for one session.
pub struct Watchdog {
    timeout: Duration,
    poll_interval: Duration,
    on_timeout: Option<TimeoutCallback>,
    clock: Arc<PetClock>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("state", &self.state())
            .finish()
    }
}

impl Watchdog {
    /// Create a stopped watchdog. The poll interval defaults to
    /// `min(10s, timeout / 5)`, floored at 100ms.
    pub fn new(timeout: Duration, on_timeout: Option<TimeoutCallback>) -> Self {
        let poll_interval = (timeout / 5).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        Self {
            timeout,
            poll_interval,
            on_timeout,
            clock: Arc::new(PetClock::new()),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Override the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn state(&self) -> WatchdogState {
        match &self.task {
            Some(task) if !task.is_finished() => WatchdogState::Running,
            _ => WatchdogState::Stopped,
        }
    }

    /// Handle for petting from the session path.
    pub fn handle(&self) -> WatchdogHandle {
        WatchdogHandle {
            clock: Arc::clone(&self.clock),
        }
    }

    /// Record activity now.
    pub fn pet(&self) {
        self.clock.pet();
    }

    /// Spawn the monitor task. No-op when already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.state() == WatchdogState::Running {
            return;
        }

        self.clock.pet();
        self.cancel = CancellationToken::new();

        let cancel = self.cancel.clone();
        let clock = Arc::clone(&self.clock);
        let on_timeout = self.on_timeout.clone();
        let timeout = self.timeout;
        let poll_interval = self.poll_interval;

        debug!(
            timeout_secs = timeout.as_secs_f64(),
            poll_secs = poll_interval.as_secs_f64(),
            "watchdog started"
        );

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                let elapsed = clock.since_pet();
                if elapsed > timeout {
                    warn!(
                        silent_secs = elapsed.as_secs(),
                        timeout_secs = timeout.as_secs(),
                        "watchdog timeout: no session activity"
                    );
                    if let Some(callback) = &on_timeout {
                        callback(elapsed);
                    }
                    clock.pet();
                }
            }
        }));
    }

    /// Cancel the monitor task and wait for it to finish. After this returns
    /// the callback will not fire again. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "watchdog task panicked");
                }
            }
            debug!("watchdog stopped");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback() -> (Arc<AtomicUsize>, TimeoutCallback) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let callback: TimeoutCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (fired, callback)
    }

    #[test]
    fn test_default_poll_interval() {
        let short = Watchdog::new(Duration::from_secs(5), None);
        assert_eq!(short.poll_interval(), Duration::from_secs(1));
        let long = Watchdog::new(Duration::from_secs(300), None);
        assert_eq!(long.poll_interval(), MAX_POLL_INTERVAL);
        let tiny = Watchdog::new(Duration::from_millis(10), None);
        assert_eq!(tiny.poll_interval(), MIN_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_breach() {
        let (fired, callback) = counting_callback();
        let mut watchdog = Watchdog::new(Duration::from_secs(5), Some(callback));
        watchdog.start();
        assert_eq!(watchdog.state(), WatchdogState::Running);

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // clock was reset at the breach; the next one needs a full timeout
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        watchdog.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pet_prevents_timeout() {
        let (fired, callback) = counting_callback();
        let mut watchdog = Watchdog::new(Duration::from_secs(5), Some(callback));
        let handle = watchdog.handle();
        watchdog.start();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            handle.pet();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.since_pet() < Duration::from_secs(1));

        watchdog.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_callback_after_stop() {
        let (fired, callback) = counting_callback();
        let mut watchdog = Watchdog::new(Duration::from_secs(5), Some(callback));
        watchdog.start();

        tokio::time::sleep(Duration::from_millis(6500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        watchdog.stop().await;
        assert_eq!(watchdog.state(), WatchdogState::Stopped);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_restartable() {
        let (fired, callback) = counting_callback();
        let mut watchdog = Watchdog::new(Duration::from_secs(2), Some(callback));

        watchdog.stop().await;
        watchdog.start();
        watchdog.stop().await;
        watchdog.stop().await;

        watchdog.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        watchdog.stop().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
