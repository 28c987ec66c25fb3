//! Analytics Job Execution Core
//!
//! This library drives a long-running, stateful analytics job:
//! - Job lifecycle state machine
//! - Streaming input to a backing process with usage accounting
//! - Flush request/acknowledgement coordination between threads
//! - Periodic task scheduling
//! - Chunked historical extraction
//! - Asynchronous score renormalization
//!
//! [`job::AnalyticsJob`] ties the pieces together.

pub mod chunking;
pub mod clock;
pub mod flush;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod persistence;
pub mod process;
pub mod realtime;
pub mod renormalize;
pub mod scheduler;
pub mod status;
pub mod usage;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use aj_common::{Error, FlushId, JobId, Result};
pub use chunking::{ChunkPlan, DataSummary, ExtractionChunk};
pub use flush::FlushCoordinator;
pub use job::{AnalyticsJob, JobCollaborators};
pub use lifecycle::{JobLifecycle, JobState};
pub use renormalize::{NoopRenormalizer, QuantilesSnapshot, Renormalizer, ShortCircuitingRenormalizer};
pub use realtime::{ProblemTracker, RealtimeRun, RealtimeScheduler, RealtimeSearch};
pub use scheduler::{NextRun, PeriodicTaskRunner, RunnerState, StopHandle};
pub use usage::{CountingReader, UsageReporter, UsageTotals};
