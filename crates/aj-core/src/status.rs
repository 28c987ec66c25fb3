//! Job status reporting collaborator.

use aj_common::JobId;
use tracing::{info, warn};

use crate::lifecycle::JobState;
use crate::logging::event_names;

/// Observes job state changes and health for external reporting.
///
/// Implementations must not block: calls arrive from the ingest thread,
/// the result-reader thread and the periodic runner.
pub trait JobStatusObserver: Send + Sync {
    fn state_changed(&self, job_id: &JobId, from: JobState, to: JobState);

    /// A non-fatal problem, e.g. a failed usage persistence tick.
    fn degraded(&self, job_id: &JobId, reason: &str);
}

/// Observer that only emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusObserver;

impl JobStatusObserver for LoggingStatusObserver {
    fn state_changed(&self, job_id: &JobId, from: JobState, to: JobState) {
        info!(
            event = event_names::JOB_STATE_CHANGED,
            job_id = %job_id,
            from = %from,
            to = %to,
            "job state changed"
        );
    }

    fn degraded(&self, job_id: &JobId, reason: &str) {
        warn!(
            event = event_names::JOB_DEGRADED,
            job_id = %job_id,
            reason,
            "job degraded"
        );
    }
}
