//! Flush request/acknowledgement coordination.
//!
//! A command thread writes a flush control record to the backing process
//! and blocks in [`FlushCoordinator::wait_for_flush`]; the result-reader
//! thread calls [`FlushCoordinator::acknowledge_flush`] when it sees the
//! matching acknowledgement. Either side may arrive first: both get-or-create
//! the same one-shot latch for the flush id.
//!
//! One coordinator exists per job. [`FlushCoordinator::clear`] releases every
//! waiter when the job closes or its process dies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use aj_common::{Error, FlushId, JobId, Result};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::logging::event_names;

/// How a latch was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Acknowledged,
    Cleared,
}

/// Result of waiting on a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushWait {
    Acknowledged,
    TimedOut,
    Cleared,
}

/// Single-use latch. The first signal wins; later ones are ignored.
#[derive(Debug, Default)]
struct FlushLatch {
    signal: Mutex<Option<Signal>>,
    cond: Condvar,
}

impl FlushLatch {
    fn signal(&self, signal: Signal) {
        let mut slot = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(signal);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Option<Signal> {
        let slot = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .cond
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *slot
    }
}

/// Registry of in-flight flushes for one job.
#[derive(Debug)]
pub struct FlushCoordinator {
    job_id: JobId,
    latches: DashMap<FlushId, Arc<FlushLatch>>,
    cleared: AtomicBool,
}

impl FlushCoordinator {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            latches: DashMap::new(),
            cleared: AtomicBool::new(false),
        }
    }

    /// Block until `flush_id` is acknowledged, the timeout elapses, or the
    /// coordinator is cleared. Returns `true` only on acknowledgement.
    pub fn wait_for_flush(&self, flush_id: &FlushId, timeout: Duration) -> bool {
        self.wait(flush_id, timeout) == FlushWait::Acknowledged
    }

    /// Like [`wait_for_flush`](Self::wait_for_flush) but maps the outcome to
    /// `FlushTimeout` / `FlushCleared` errors.
    pub fn await_flush(&self, flush_id: &FlushId, timeout: Duration) -> Result<()> {
        match self.wait(flush_id, timeout) {
            FlushWait::Acknowledged => Ok(()),
            FlushWait::TimedOut => Err(Error::FlushTimeout {
                flush_id: flush_id.to_string(),
                timeout_ms: timeout.as_millis().try_into().unwrap_or(u64::MAX),
            }),
            FlushWait::Cleared => Err(Error::FlushCleared {
                flush_id: flush_id.to_string(),
            }),
        }
    }

    /// Wait and report how the wait ended. The registry entry for
    /// `flush_id` is always removed before returning.
    pub fn wait(&self, flush_id: &FlushId, timeout: Duration) -> FlushWait {
        if self.is_cleared() {
            return FlushWait::Cleared;
        }

        let latch = self.latch_for(flush_id);

        // clear() may have drained the registry between the check above and
        // the insert; nobody would ever signal this latch.
        if self.is_cleared() {
            self.latches.remove(flush_id);
            return FlushWait::Cleared;
        }

        let outcome = match latch.wait(timeout) {
            Some(Signal::Acknowledged) => FlushWait::Acknowledged,
            Some(Signal::Cleared) => FlushWait::Cleared,
            None => FlushWait::TimedOut,
        };
        self.latches.remove(flush_id);

        match outcome {
            FlushWait::Acknowledged => debug!(
                event = event_names::FLUSH_COMPLETED,
                job_id = %self.job_id,
                flush_id = %flush_id,
                "flush acknowledged"
            ),
            FlushWait::TimedOut => warn!(
                event = event_names::FLUSH_TIMED_OUT,
                job_id = %self.job_id,
                flush_id = %flush_id,
                timeout_ms = timeout.as_millis() as u64,
                "timed out waiting for flush acknowledgement"
            ),
            FlushWait::Cleared => debug!(
                job_id = %self.job_id,
                flush_id = %flush_id,
                "flush wait released by clear"
            ),
        }
        outcome
    }

    /// Signal the latch for `flush_id`, creating it if no waiter exists yet.
    ///
    /// Ignored once the coordinator is cleared.
    pub fn acknowledge_flush(&self, flush_id: &FlushId) {
        if self.is_cleared() {
            debug!(
                job_id = %self.job_id,
                flush_id = %flush_id,
                "ignoring flush acknowledgement after clear"
            );
            return;
        }
        debug!(
            event = event_names::FLUSH_ACKNOWLEDGED,
            job_id = %self.job_id,
            flush_id = %flush_id,
            "flush acknowledgement received"
        );
        self.latch_for(flush_id).signal(Signal::Acknowledged);

        // Same window as in `wait`: a clear() that drained the registry
        // before our insert leaves the entry with no one to claim it.
        if self.is_cleared() {
            self.latches.remove(flush_id);
        }
    }

    /// Release every waiter and refuse future waits. Only the first call
    /// has an effect.
    pub fn clear(&self) {
        if self.cleared.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut released = 0usize;
        self.latches.retain(|_, latch| {
            latch.signal(Signal::Cleared);
            released += 1;
            false
        });
        info!(
            event = event_names::FLUSH_CLEARED,
            job_id = %self.job_id,
            released,
            "flush coordinator cleared"
        );
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }

    /// Number of registered latches (waiting or acknowledged-but-unclaimed).
    pub fn pending(&self) -> usize {
        self.latches.len()
    }

    fn latch_for(&self, flush_id: &FlushId) -> Arc<FlushLatch> {
        self.latches
            .entry(flush_id.clone())
            .or_insert_with(|| Arc::new(FlushLatch::default()))
            .value()
            .clone()
    }
}
