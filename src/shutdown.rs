//! Shutdown sequencing.
//!
//! ```text
//!   Running ──begin_shutdown()──▶ Draining ──last request_finished()──▶ Stopped
//!                                    │                                     ▲
//!                                    └──────── drain timeout elapsed ──────┘
//! ```
//!
//! The [`ShutdownCoordinator`] counts in-flight requests, refuses new ones once
//! draining starts, and publishes `Stopped` exactly once: either when the last
//! request finishes or when the drain timeout forces it. The host awaits
//! [`ShutdownCoordinator::stopped`] and exits after it resolves.
//!
//! Set the drain timeout below the orchestrator's grace period (Kubernetes'
//! `terminationGracePeriodSeconds`, 30 s by default) so the forced stop wins
//! the race against SIGKILL.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Where the process is in its shutdown sequence. Only ever moves forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Phase {
    /// Accepting requests.
    Running,
    /// Finishing in-flight requests, refusing new ones.
    Draining,
    /// Terminal. The host should exit.
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running  => "running",
            Self::Draining => "draining",
            Self::Stopped  => "stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the coordinator reached [`Phase::Stopped`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// Every in-flight request finished.
    Drained,
    /// The drain timeout elapsed with requests still in flight.
    TimedOut,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drained  => "drained",
            Self::TimedOut => "timed out",
        })
    }
}

struct ShutdownState {
    phase: Phase,
    active: usize,
    stop_reason: Option<StopReason>,
    drain_timeout: Duration,
    timer: Option<AbortHandle>,
}

struct Inner {
    state: Mutex<ShutdownState>,
    phase_tx: watch::Sender<Phase>,
}

/// Process-wide shutdown state, shared by cloning.
///
/// Create one at startup and hand clones to whatever admits requests.
///
/// ```rust
/// use std::time::Duration;
/// use quiesce::{Phase, ShutdownCoordinator};
///
/// let shutdown = ShutdownCoordinator::new(Duration::from_secs(10));
/// let guard = shutdown.track().unwrap();
///
/// shutdown.begin_shutdown();
/// assert_eq!(shutdown.phase(), Phase::Draining);
/// assert!(shutdown.track().is_err());
///
/// drop(guard);
/// assert_eq!(shutdown.phase(), Phase::Stopped);
/// ```
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    /// `drain_timeout` bounds how long [`Phase::Draining`] may last.
    pub fn new(drain_timeout: Duration) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Running);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ShutdownState {
                    phase: Phase::Running,
                    active: 0,
                    stop_reason: None,
                    drain_timeout,
                    timer: None,
                }),
                phase_tx,
            }),
        }
    }

    pub fn phase(&self) -> Phase { self.lock().phase }
    pub fn active_requests(&self) -> usize { self.lock().active }
    pub fn stop_reason(&self) -> Option<StopReason> { self.lock().stop_reason }
    pub fn drain_timeout(&self) -> Duration { self.lock().drain_timeout }

    /// Changes the drain budget for every clone of this coordinator.
    ///
    /// Has no effect on a drain that is already running.
    pub fn set_drain_timeout(&self, timeout: Duration) {
        self.lock().drain_timeout = timeout;
    }

    /// Admits one request. Fails once shutdown has begun.
    pub fn request_started(&self) -> Result<(), Error> {
        let mut state = self.lock();
        if state.phase != Phase::Running {
            return Err(Error::NotAccepting(state.phase));
        }
        state.active += 1;
        Ok(())
    }

    /// Marks one admitted request as complete.
    ///
    /// While draining, the call that brings the count to zero stops the
    /// coordinator.
    pub fn request_finished(&self) {
        let mut state = self.lock();
        if state.active == 0 {
            warn!(target: "quiesce::bug", phase = %state.phase, "request finished with none in flight");
            return;
        }
        state.active -= 1;
        if state.phase == Phase::Draining && state.active == 0 {
            self.stop(&mut state, StopReason::Drained);
        }
    }

    /// [`request_started`](Self::request_started) paired with a guard that
    /// calls [`request_finished`](Self::request_finished) on drop.
    pub fn track(&self) -> Result<InFlight, Error> {
        self.request_started()?;
        Ok(InFlight { coordinator: self.clone() })
    }

    /// Starts draining. Calling it again, or after the stop, does nothing.
    ///
    /// Arms the drain timer on the current tokio runtime, or on a helper
    /// thread when called outside one.
    pub fn begin_shutdown(&self) {
        let mut state = self.lock();
        if state.phase != Phase::Running {
            debug!(phase = %state.phase, "shutdown already in progress");
            return;
        }

        state.phase = Phase::Draining;
        self.inner.phase_tx.send_replace(Phase::Draining);
        info!(
            in_flight = state.active,
            drain_timeout_ms = state.drain_timeout.as_millis() as u64,
            "draining in-flight requests"
        );

        if state.active == 0 {
            self.stop(&mut state, StopReason::Drained);
            return;
        }
        state.timer = self.arm_drain_timer(state.drain_timeout);
    }

    /// A receiver that observes every phase transition.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.inner.phase_tx.subscribe()
    }

    /// Resolves once the coordinator is stopped, immediately if it already is.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.subscribe();
        // `self` owns the sender, so the channel cannot close under us.
        if rx.wait_for(|phase| *phase == Phase::Stopped).await.is_err() {
            warn!("shutdown channel closed before stop");
        }
        self.stop_reason().unwrap_or(StopReason::TimedOut)
    }

    /// Spawns the task that forces the stop once `timeout` elapses.
    ///
    /// Called from a plain thread (a sync signal handler, say) there is no
    /// runtime to spawn on, so a sleeping OS thread stands in. It cannot be
    /// aborted; [`force_stop`](Self::force_stop) ignores it if the drain
    /// finished first.
    fn arm_drain_timer(&self, timeout: Duration) -> Option<AbortHandle> {
        let coordinator = self.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no tokio runtime, drain timer runs on a thread");
            let spawned = std::thread::Builder::new()
                .name("quiesce-drain-timer".to_owned())
                .spawn(move || {
                    std::thread::sleep(timeout);
                    coordinator.force_stop();
                });
            if let Err(e) = spawned {
                error!("failed to spawn drain timer thread: {e}");
            }
            return None;
        };
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.force_stop();
        });
        Some(task.abort_handle())
    }

    fn force_stop(&self) {
        let mut state = self.lock();
        if state.phase == Phase::Stopped {
            return;
        }
        warn!(
            abandoned = state.active,
            drain_timeout_ms = state.drain_timeout.as_millis() as u64,
            "drain timeout elapsed, forcing stop"
        );
        self.stop(&mut state, StopReason::TimedOut);
    }

    /// The single place `Stopped` is entered. Callers hold the lock and have
    /// checked the phase, so this runs at most once.
    fn stop(&self, state: &mut ShutdownState, reason: StopReason) {
        state.phase = Phase::Stopped;
        state.stop_reason = Some(reason);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        self.inner.phase_tx.send_replace(Phase::Stopped);
        info!(%reason, abandoned = state.active, "shutdown complete");
    }

    fn lock(&self) -> MutexGuard<'_, ShutdownState> {
        // The state is plain counters; a panic elsewhere cannot leave it torn.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ShutdownCoordinator")
            .field("phase", &state.phase)
            .field("active", &state.active)
            .field("stop_reason", &state.stop_reason)
            .finish()
    }
}

/// One admitted request. Dropping it marks the request finished.
#[must_use = "dropping the guard immediately finishes the request"]
pub struct InFlight {
    coordinator: ShutdownCoordinator,
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InFlight")
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.coordinator.request_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::capture_logs;

    fn coordinator() -> ShutdownCoordinator {
        ShutdownCoordinator::new(Duration::from_secs(5))
    }

    #[test]
    fn starts_running_and_counts_requests() {
        let c = coordinator();
        c.request_started().unwrap();
        c.request_started().unwrap();
        assert_eq!(c.phase(), Phase::Running);
        assert_eq!(c.active_requests(), 2);

        c.request_finished();
        assert_eq!(c.active_requests(), 1);
        assert_eq!(c.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn begin_shutdown_is_idempotent() {
        let c = coordinator();
        let _guard = c.track().unwrap();

        c.begin_shutdown();
        c.begin_shutdown();
        assert_eq!(c.phase(), Phase::Draining);
        assert_eq!(c.active_requests(), 1);
    }

    #[tokio::test]
    async fn draining_refuses_new_requests() {
        let c = coordinator();
        let _guard = c.track().unwrap();
        c.begin_shutdown();

        assert!(matches!(c.request_started(), Err(Error::NotAccepting(Phase::Draining))));
        assert_eq!(c.active_requests(), 1);
    }

    #[tokio::test]
    async fn stops_exactly_on_the_last_finish() {
        let c = coordinator();
        let mut rx = c.subscribe();
        for _ in 0..3 {
            c.request_started().unwrap();
        }

        c.begin_shutdown();
        assert_eq!(c.phase(), Phase::Draining);
        assert_eq!(c.active_requests(), 3);
        assert_eq!(*rx.borrow_and_update(), Phase::Draining);

        c.request_finished();
        c.request_finished();
        assert_eq!(c.phase(), Phase::Draining);
        assert!(!rx.has_changed().unwrap());

        c.request_finished();
        assert_eq!(c.phase(), Phase::Stopped);
        assert_eq!(c.stop_reason(), Some(StopReason::Drained));
        assert_eq!(*rx.borrow_and_update(), Phase::Stopped);

        // A stray finish after the stop publishes nothing.
        c.request_finished();
        assert!(!rx.has_changed().unwrap());
        assert_eq!(c.stopped().await, StopReason::Drained);
    }

    #[tokio::test]
    async fn idle_shutdown_stops_immediately() {
        let c = coordinator();
        c.begin_shutdown();
        assert_eq!(c.phase(), Phase::Stopped);
        assert_eq!(c.stop_reason(), Some(StopReason::Drained));

        c.begin_shutdown();
        assert_eq!(c.phase(), Phase::Stopped);
        assert!(c.request_started().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_forces_a_single_stop() {
        let (_logs_guard, logs) = capture_logs();
        let c = coordinator();
        let mut rx = c.subscribe();
        let first = c.track().unwrap();
        let second = c.track().unwrap();

        c.begin_shutdown();
        assert_eq!(*rx.borrow_and_update(), Phase::Draining);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(c.phase(), Phase::Stopped);
        assert_eq!(c.stop_reason(), Some(StopReason::TimedOut));
        assert_eq!(c.active_requests(), 2);
        assert_eq!(*rx.borrow_and_update(), Phase::Stopped);
        assert!(logs.contents().contains("drain timeout elapsed, forcing stop"));

        // The late natural drain must not fire a second stop.
        drop(first);
        drop(second);
        assert_eq!(c.active_requests(), 0);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(c.stop_reason(), Some(StopReason::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn natural_drain_cancels_the_timer() {
        let (_logs_guard, logs) = capture_logs();
        let c = coordinator();
        let guard = c.track().unwrap();

        c.begin_shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(guard);
        assert_eq!(c.stop_reason(), Some(StopReason::Drained));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(c.stop_reason(), Some(StopReason::Drained));
        assert!(!logs.contents().contains("forcing stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_waits_for_the_drain() {
        let c = coordinator();
        let guard = c.track().unwrap();
        c.begin_shutdown();

        let waiter = tokio::spawn({
            let c = c.clone();
            async move { c.stopped().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.unwrap(), StopReason::Drained);
    }

    #[test]
    fn extra_finish_never_underflows() {
        let c = coordinator();
        c.request_finished();
        assert_eq!(c.active_requests(), 0);
        assert_eq!(c.phase(), Phase::Running);
    }

    #[test]
    fn without_a_runtime_the_drain_timeout_still_fires() {
        let c = ShutdownCoordinator::new(Duration::from_millis(50));
        let _stuck = c.track().unwrap();
        c.begin_shutdown();
        assert_eq!(c.phase(), Phase::Draining);

        for _ in 0..200 {
            if c.phase() == Phase::Stopped {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(c.phase(), Phase::Stopped);
        assert_eq!(c.stop_reason(), Some(StopReason::TimedOut));
        assert_eq!(c.active_requests(), 1);
    }

    #[test]
    fn without_a_runtime_a_natural_drain_still_wins() {
        let c = ShutdownCoordinator::new(Duration::from_millis(50));
        let guard = c.track().unwrap();
        c.begin_shutdown();
        drop(guard);
        assert_eq!(c.stop_reason(), Some(StopReason::Drained));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(c.stop_reason(), Some(StopReason::Drained));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_change_is_shared_by_clones() {
        let c = coordinator();
        let handle = c.clone();
        handle.set_drain_timeout(Duration::from_millis(100));
        assert_eq!(c.drain_timeout(), Duration::from_millis(100));

        let _stuck = c.track().unwrap();
        c.begin_shutdown();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.stop_reason(), Some(StopReason::TimedOut));
    }
}
