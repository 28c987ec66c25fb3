//! Persistence collaborators.
//!
//! The core never retries a write itself. Stores are expected to be durable
//! and idempotent under retry; a failure is surfaced to whoever triggered the
//! write.

use aj_common::{EpochMillis, JobId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::renormalize::QuantilesSnapshot;
use crate::usage::UsageTotals;

/// Errors reported by persistence collaborators.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

impl From<PersistError> for aj_common::Error {
    fn from(err: PersistError) -> Self {
        aj_common::Error::PersistenceFailure(err.to_string())
    }
}

/// Receives running usage totals.
pub trait UsagePersister: Send + Sync {
    /// `totals` are lifetime totals for the job, not the delta since the
    /// last call.
    fn persist_usage(&self, job_id: &JobId, totals: &UsageTotals) -> Result<(), PersistError>;
}

/// A persisted result bucket whose score may be renormalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub timestamp_ms: EpochMillis,
    /// Score as first emitted by the backing process.
    pub initial_score: f64,
    /// Current (possibly renormalized) score.
    pub score: f64,
}

/// Results storage used for quantiles and renormalization.
pub trait ResultsStore: Send + Sync {
    fn persist_quantiles(&self, snapshot: &QuantilesSnapshot) -> Result<(), PersistError>;

    /// Buckets with `timestamp_ms <= end_ms`, ordered by time, paged.
    fn buckets(
        &self,
        job_id: &JobId,
        end_ms: EpochMillis,
        skip: usize,
        take: usize,
    ) -> Result<Vec<Bucket>, PersistError>;

    fn update_bucket(&self, job_id: &JobId, bucket: &Bucket) -> Result<(), PersistError>;
}
