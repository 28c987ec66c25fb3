//! Periodic task runner.
//!
//! Runs a task on a dedicated thread. After each invocation the next run
//! time is computed from the current time, so a slow invocation delays the
//! schedule by at most its own duration. Stopping is cooperative: an
//! in-flight invocation always completes.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aj_common::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::logging::event_names;

/// Runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Idle => "idle",
            RunnerState::Running => "running",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Common next-run functions.
pub struct NextRun;

impl NextRun {
    /// Run again `delay` after the previous invocation finished.
    pub fn fixed_delay(delay: Duration) -> impl Fn(DateTime<Utc>) -> DateTime<Utc> + Send + 'static {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        move |now| now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Run at the next multiple of `frequency` after now, plus `delay`.
    ///
    /// The delay keeps the run strictly after the boundary it is aligned to.
    pub fn aligned(
        frequency: Duration,
        delay: Duration,
    ) -> impl Fn(DateTime<Utc>) -> DateTime<Utc> + Send + 'static {
        let frequency_ms = i64::try_from(frequency.as_millis()).unwrap_or(i64::MAX).max(1);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        move |now| {
            let now_ms = now.timestamp_millis();
            let next_ms = (now_ms.div_euclid(frequency_ms) + 1)
                .saturating_mul(frequency_ms)
                .saturating_add(delay_ms);
            DateTime::<Utc>::from_timestamp_millis(next_ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
    }
}

struct Shared {
    state: Mutex<RunnerState>,
    cond: Condvar,
    invocations: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs a task repeatedly on its own thread.
pub struct PeriodicTaskRunner {
    name: String,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTaskRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(RunnerState::Idle),
                cond: Condvar::new(),
                invocations: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunnerState {
        *self.shared.lock()
    }

    /// Completed task invocations.
    pub fn invocations(&self) -> u64 {
        self.shared.invocations.load(Ordering::SeqCst)
    }

    /// Handle that asks the runner to stop without waiting, usable from
    /// inside the task itself.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start running `task`, first at `next_run(now)`.
    ///
    /// Errors and panics from `task` are logged and the schedule continues.
    /// Fails with `AlreadyStarted` unless the runner is `Idle`.
    pub fn start<F, E, N>(&self, mut task: F, next_run: N) -> Result<()>
    where
        F: FnMut() -> std::result::Result<(), E> + Send + 'static,
        E: fmt::Display,
        N: Fn(DateTime<Utc>) -> DateTime<Utc> + Send + 'static,
    {
        let mut state = self.shared.lock();
        if *state != RunnerState::Idle {
            return Err(Error::AlreadyStarted {
                name: self.name.clone(),
                state: state.to_string(),
            });
        }

        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut next = next_run(Utc::now());
                loop {
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    let guard = shared.lock();
                    let (guard, _) = shared
                        .cond
                        .wait_timeout_while(guard, wait, |s| *s == RunnerState::Running)
                        .unwrap_or_else(PoisonError::into_inner);
                    if *guard != RunnerState::Running {
                        break;
                    }
                    drop(guard);

                    match panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                        Ok(Ok(())) => debug!(runner = %name, "task completed"),
                        Ok(Err(e)) => warn!(
                            event = event_names::RUNNER_TASK_FAILED,
                            runner = %name,
                            error = %e,
                            "periodic task failed"
                        ),
                        Err(_) => error!(
                            event = event_names::RUNNER_TASK_FAILED,
                            runner = %name,
                            "periodic task panicked"
                        ),
                    }
                    shared.invocations.fetch_add(1, Ordering::SeqCst);
                    next = next_run(Utc::now());
                }

                *shared.lock() = RunnerState::Stopped;
                shared.cond.notify_all();
            })?;

        *state = RunnerState::Running;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(event = event_names::RUNNER_STARTED, runner = %self.name, "periodic task runner started");
        Ok(())
    }

    /// Request termination and wait up to `timeout` for the runner thread to
    /// exit. Returns `false` if an invocation was still in flight at the
    /// deadline; the runner keeps stopping in the background.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut state = self.shared.lock();
        match *state {
            RunnerState::Idle | RunnerState::Stopped => {
                *state = RunnerState::Stopped;
                return true;
            }
            RunnerState::Running => {
                *state = RunnerState::Stopping;
                self.shared.cond.notify_all();
            }
            RunnerState::Stopping => {}
        }

        let (state, _) = self
            .shared
            .cond
            .wait_timeout_while(state, timeout, |s| *s != RunnerState::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        if *state != RunnerState::Stopped {
            warn!(
                runner = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "periodic task runner did not stop in time"
            );
            return false;
        }
        drop(state);

        if let Some(handle) = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = handle.join();
        }
        info!(event = event_names::RUNNER_STOPPED, runner = %self.name, "periodic task runner stopped");
        true
    }

    /// [`stop`](Self::stop), mapping a missed deadline to `TaskRunnerStopTimeout`.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.stop(timeout) {
            Ok(())
        } else {
            Err(Error::TaskRunnerStopTimeout {
                name: self.name.clone(),
                timeout_ms: timeout.as_millis().try_into().unwrap_or(u64::MAX),
            })
        }
    }
}

/// Non-blocking stop request for a [`PeriodicTaskRunner`].
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// The in-flight invocation, if any, completes; no further one starts.
    pub fn request_stop(&self) {
        let mut state = self.shared.lock();
        if *state == RunnerState::Running {
            *state = RunnerState::Stopping;
            self.shared.cond.notify_all();
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("state", &*self.shared.lock())
            .finish()
    }
}

impl Drop for PeriodicTaskRunner {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if *state == RunnerState::Running {
            *state = RunnerState::Stopping;
            self.shared.cond.notify_all();
        }
    }
}

impl fmt::Debug for PeriodicTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTaskRunner")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("invocations", &self.invocations())
            .finish()
    }
}
