//! Asynchronous score renormalization.
//!
//! When the backing process emits a new [`QuantilesSnapshot`], previously
//! persisted bucket scores are recomputed against it off the ingest path.
//! Only the newest snapshot matters: one submitted while another is still
//! queued replaces it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use aj_common::{EpochMillis, JobId, Result};
use aj_config::RenormalizationConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::logging::event_names;
use crate::persistence::{Bucket, ResultsStore};

/// Opaque statistical summary of the score distribution so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantilesSnapshot {
    pub job_id: JobId,
    pub timestamp_ms: EpochMillis,
    pub quantile_state: String,
}

/// Rescores buckets against a snapshot. The scoring algorithm is opaque to
/// the core.
pub trait Normalizer: Send + Sync {
    /// Returns one bucket per input bucket, in the same order.
    fn normalize(&self, snapshot: &QuantilesSnapshot, buckets: &[Bucket]) -> Result<Vec<Bucket>>;
}

/// Submission side of renormalization.
pub trait Renormalizer: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Queue `snapshot`. Never blocks beyond the hand-off.
    fn renormalize(&self, snapshot: QuantilesSnapshot);

    /// Block until everything submitted so far has been processed.
    fn wait_until_idle(&self);

    /// Stop accepting work, finish what is queued, and report whether the
    /// worker exited cleanly.
    fn shutdown(&self) -> bool;
}

/// Renormalization disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenormalizer;

impl Renormalizer for NoopRenormalizer {
    fn is_enabled(&self) -> bool {
        false
    }

    fn renormalize(&self, _snapshot: QuantilesSnapshot) {}

    fn wait_until_idle(&self) {}

    fn shutdown(&self) -> bool {
        true
    }
}

/// Outcome of one rescoring pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenormalizationStats {
    pub updated: u64,
    pub unchanged: u64,
}

/// Pages through persisted buckets and writes back changed scores.
pub struct ScoresUpdater {
    store: Arc<dyn ResultsStore>,
    normalizer: Arc<dyn Normalizer>,
    page_size: usize,
}

impl ScoresUpdater {
    pub fn new(
        store: Arc<dyn ResultsStore>,
        normalizer: Arc<dyn Normalizer>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            normalizer,
            page_size: page_size.max(1),
        }
    }

    /// Rescore every bucket up to the snapshot timestamp.
    pub fn update(&self, snapshot: &QuantilesSnapshot) -> Result<RenormalizationStats> {
        let job_id = &snapshot.job_id;
        let mut stats = RenormalizationStats::default();
        let mut skip = 0usize;

        loop {
            let page = self
                .store
                .buckets(job_id, snapshot.timestamp_ms, skip, self.page_size)?;
            if page.is_empty() {
                break;
            }

            let rescored = self.normalizer.normalize(snapshot, &page)?;
            for (old, new) in page.iter().zip(rescored.iter()) {
                if old == new {
                    stats.unchanged += 1;
                } else {
                    self.store.update_bucket(job_id, new)?;
                    stats.updated += 1;
                }
            }

            skip += page.len();
            if page.len() < self.page_size {
                break;
            }
        }

        info!(
            event = event_names::RENORMALIZATION_FINISHED,
            job_id = %job_id,
            quantiles_timestamp = snapshot.timestamp_ms,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "renormalization finished"
        );
        Ok(stats)
    }
}

#[derive(Default)]
struct QueueState {
    pending: Option<QuantilesSnapshot>,
    in_progress: bool,
    shutdown: bool,
    completed: u64,
    superseded: u64,
}

struct Queue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Renormalizes on a dedicated worker thread, skipping superseded snapshots.
pub struct ShortCircuitingRenormalizer {
    job_id: JobId,
    queue: Arc<Queue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ShortCircuitingRenormalizer {
    pub fn start(job_id: JobId, updater: ScoresUpdater) -> Result<Self> {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        });

        let worker_queue = Arc::clone(&queue);
        let worker_job = job_id.clone();
        let handle = thread::Builder::new()
            .name(format!("renormalizer-{}", job_id))
            .spawn(move || worker_loop(&worker_job, &worker_queue, &updater))?;

        Ok(Self {
            job_id,
            queue,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Snapshots processed so far.
    pub fn completed(&self) -> u64 {
        self.queue.lock().completed
    }

    /// Snapshots replaced before they were processed.
    pub fn superseded(&self) -> u64 {
        self.queue.lock().superseded
    }
}

fn worker_loop(job_id: &JobId, queue: &Queue, updater: &ScoresUpdater) {
    loop {
        let snapshot = {
            let state = queue.lock();
            let mut state = queue
                .cond
                .wait_while(state, |s| s.pending.is_none() && !s.shutdown)
                .unwrap_or_else(PoisonError::into_inner);
            match state.pending.take() {
                Some(snapshot) => {
                    state.in_progress = true;
                    snapshot
                }
                None => break,
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(|| updater.update(&snapshot))) {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(
                event = event_names::RENORMALIZATION_FAILED,
                job_id = %job_id,
                error = %e,
                "renormalization failed"
            ),
            Err(_) => error!(
                event = event_names::RENORMALIZATION_FAILED,
                job_id = %job_id,
                "renormalization panicked"
            ),
        }

        let mut state = queue.lock();
        state.in_progress = false;
        state.completed += 1;
        queue.cond.notify_all();
    }
    debug!(job_id = %job_id, "renormalizer worker exited");
}

impl Renormalizer for ShortCircuitingRenormalizer {
    fn is_enabled(&self) -> bool {
        true
    }

    fn renormalize(&self, snapshot: QuantilesSnapshot) {
        let mut state = self.queue.lock();
        if state.shutdown {
            warn!(
                job_id = %self.job_id,
                quantiles_timestamp = snapshot.timestamp_ms,
                "renormalizer shut down; dropping quantiles"
            );
            return;
        }
        if let Some(old) = state.pending.replace(snapshot) {
            state.superseded += 1;
            debug!(
                job_id = %self.job_id,
                superseded_timestamp = old.timestamp_ms,
                "skipping superseded quantiles"
            );
        }
        self.queue.cond.notify_all();
    }

    fn wait_until_idle(&self) {
        let state = self.queue.lock();
        let _idle = self
            .queue
            .cond
            .wait_while(state, |s| s.pending.is_some() || s.in_progress)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn shutdown(&self) -> bool {
        {
            let mut state = self.queue.lock();
            state.shutdown = true;
            self.queue.cond.notify_all();
        }
        match self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for ShortCircuitingRenormalizer {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        state.shutdown = true;
        self.queue.cond.notify_all();
    }
}

/// Pick the implementation for `config`.
pub fn renormalizer_from_config(
    job_id: JobId,
    config: &RenormalizationConfig,
    store: Arc<dyn ResultsStore>,
    normalizer: Arc<dyn Normalizer>,
) -> Result<Arc<dyn Renormalizer>> {
    if !config.enabled {
        return Ok(Arc::new(NoopRenormalizer));
    }
    let updater = ScoresUpdater::new(store, normalizer, config.page_size);
    Ok(Arc::new(ShortCircuitingRenormalizer::start(job_id, updater)?))
}
