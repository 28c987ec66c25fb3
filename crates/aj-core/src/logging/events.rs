//! Standard event names used in logging.
//!
//! Emitted as the `event` field so JSONL consumers can filter on a stable key.

pub mod event_names {
    // Job lifecycle
    pub const JOB_OPENED: &str = "job.opened";
    pub const JOB_CLOSED: &str = "job.closed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const JOB_STATE_CHANGED: &str = "job.state_changed";
    pub const JOB_DEGRADED: &str = "job.degraded";

    // Flush coordination
    pub const FLUSH_REQUESTED: &str = "flush.requested";
    pub const FLUSH_ACKNOWLEDGED: &str = "flush.acknowledged";
    pub const FLUSH_COMPLETED: &str = "flush.completed";
    pub const FLUSH_TIMED_OUT: &str = "flush.timed_out";
    pub const FLUSH_CLEARED: &str = "flush.cleared";

    // Usage accounting
    pub const USAGE_PERSISTED: &str = "usage.persisted";
    pub const USAGE_PERSIST_FAILED: &str = "usage.persist_failed";
    pub const USAGE_MILESTONE: &str = "usage.milestone";

    // Periodic runner
    pub const RUNNER_STARTED: &str = "runner.started";
    pub const RUNNER_STOPPED: &str = "runner.stopped";
    pub const RUNNER_TASK_FAILED: &str = "runner.task_failed";

    // Chunked extraction
    pub const LOOKBACK_STARTED: &str = "lookback.started";
    pub const LOOKBACK_FINISHED: &str = "lookback.finished";
    pub const CHUNK_STARTED: &str = "lookback.chunk_started";

    // Real-time extraction
    pub const REALTIME_STARTED: &str = "realtime.started";
    pub const REALTIME_WINDOW: &str = "realtime.window";
    pub const REALTIME_PROBLEM: &str = "realtime.problem";
    pub const REALTIME_RECOVERED: &str = "realtime.recovered";
    pub const REALTIME_NO_DATA: &str = "realtime.no_data";
    pub const REALTIME_EXHAUSTED: &str = "realtime.exhausted";

    // Results and renormalization
    pub const RESULTS_EOF: &str = "results.eof";
    pub const RESULTS_PARSE_FAILED: &str = "results.parse_failed";
    pub const QUANTILES_PERSIST_FAILED: &str = "results.quantiles_persist_failed";
    pub const RENORMALIZATION_FINISHED: &str = "renormalization.finished";
    pub const RENORMALIZATION_FAILED: &str = "renormalization.failed";
}
