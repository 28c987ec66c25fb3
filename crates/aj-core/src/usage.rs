//! Rate-limited usage accounting.
//!
//! [`UsageReporter`] accumulates bytes, fields and records read and hands
//! lifetime totals to a [`UsagePersister`] at most once per report interval.
//! [`CountingReader`] feeds it from any byte source.

use std::io::{self, Read};
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use aj_common::{JobId, Result};
use aj_config::UsageConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::logging::event_names;
use crate::persistence::UsagePersister;
use crate::status::JobStatusObserver;

/// Bytes, fields and records read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub bytes_read: u64,
    pub fields_read: u64,
    pub records_read: u64,
}

impl UsageTotals {
    pub fn new(bytes_read: u64, fields_read: u64, records_read: u64) -> Self {
        Self {
            bytes_read,
            fields_read,
            records_read,
        }
    }
}

impl Add for UsageTotals {
    type Output = UsageTotals;

    fn add(self, rhs: UsageTotals) -> UsageTotals {
        UsageTotals {
            bytes_read: self.bytes_read.saturating_add(rhs.bytes_read),
            fields_read: self.fields_read.saturating_add(rhs.fields_read),
            records_read: self.records_read.saturating_add(rhs.records_read),
        }
    }
}

/// Accumulates usage counters and persists lifetime totals on an interval.
///
/// Counters since the last report are reset only after the persister
/// accepts a report. On failure they are kept and folded into the next one.
pub struct UsageReporter {
    job_id: JobId,
    persister: Arc<dyn UsagePersister>,
    observer: Arc<dyn JobStatusObserver>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    log_milestones: bool,

    bytes_since: AtomicU64,
    fields_since: AtomicU64,
    records_since: AtomicU64,
    records_lifetime: AtomicU64,

    /// Totals accepted by the persister so far.
    persisted: Mutex<UsageTotals>,
    last_attempt: Mutex<Instant>,
    report_lock: Mutex<()>,
}

impl UsageReporter {
    pub fn new(
        job_id: JobId,
        config: &UsageConfig,
        persister: Arc<dyn UsagePersister>,
        observer: Arc<dyn JobStatusObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            job_id,
            persister,
            observer,
            clock,
            interval: config.report_interval(),
            log_milestones: config.log_milestones,
            bytes_since: AtomicU64::new(0),
            fields_since: AtomicU64::new(0),
            records_since: AtomicU64::new(0),
            records_lifetime: AtomicU64::new(0),
            persisted: Mutex::new(UsageTotals::default()),
            last_attempt: Mutex::new(now),
            report_lock: Mutex::new(()),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_since.fetch_add(n, Ordering::SeqCst);
        self.report_from_ingest();
    }

    /// Count one record carrying `fields` fields.
    pub fn add_fields_records_read(&self, fields: u64) {
        self.fields_since.fetch_add(fields, Ordering::SeqCst);
        self.records_since.fetch_add(1, Ordering::SeqCst);
        let records = self.records_lifetime.fetch_add(1, Ordering::SeqCst) + 1;
        if self.log_milestones && is_milestone(records) {
            info!(
                event = event_names::USAGE_MILESTONE,
                job_id = %self.job_id,
                records,
                "records processed"
            );
        }
        self.report_from_ingest();
    }

    pub fn bytes_read_since_last_report(&self) -> u64 {
        self.bytes_since.load(Ordering::SeqCst)
    }

    pub fn fields_read_since_last_report(&self) -> u64 {
        self.fields_since.load(Ordering::SeqCst)
    }

    pub fn records_read_since_last_report(&self) -> u64 {
        self.records_since.load(Ordering::SeqCst)
    }

    pub fn since_last_report(&self) -> UsageTotals {
        UsageTotals::new(
            self.bytes_read_since_last_report(),
            self.fields_read_since_last_report(),
            self.records_read_since_last_report(),
        )
    }

    /// Totals accepted by the persister.
    pub fn persisted_totals(&self) -> UsageTotals {
        *self.persisted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything read over the job's lifetime, persisted or not.
    ///
    /// Waits for an in-flight report, whose delta is briefly held in
    /// neither counter.
    pub fn lifetime_totals(&self) -> UsageTotals {
        let _guard = self
            .report_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.persisted_totals() + self.since_last_report()
    }

    /// Persist if the interval has elapsed since the last attempt.
    ///
    /// Returns `Ok(false)` when not due or when another thread is reporting.
    pub fn report_if_due(&self) -> Result<bool> {
        let guard = match self.report_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(false),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        if !self.is_due() {
            return Ok(false);
        }
        self.report_locked(&guard)?;
        Ok(true)
    }

    /// Unconditional final report, made when the job closes.
    pub fn finish(&self) -> Result<UsageTotals> {
        let guard = self
            .report_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.report_locked(&guard)
    }

    fn is_due(&self) -> bool {
        let last = *self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.clock.now().saturating_duration_since(last) >= self.interval
    }

    fn report_from_ingest(&self) {
        if let Err(e) = self.report_if_due() {
            warn!(
                event = event_names::USAGE_PERSIST_FAILED,
                job_id = %self.job_id,
                error = %e,
                "failed to persist usage; counts carried to next report"
            );
            self.observer.degraded(&self.job_id, &e.to_string());
        }
    }

    // Caller holds `report_lock`.
    fn report_locked(&self, _guard: &std::sync::MutexGuard<'_, ()>) -> Result<UsageTotals> {
        *self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.clock.now();

        let delta = UsageTotals::new(
            self.bytes_since.swap(0, Ordering::SeqCst),
            self.fields_since.swap(0, Ordering::SeqCst),
            self.records_since.swap(0, Ordering::SeqCst),
        );

        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        let cumulative = *persisted + delta;

        match self.persister.persist_usage(&self.job_id, &cumulative) {
            Ok(()) => {
                *persisted = cumulative;
                debug!(
                    event = event_names::USAGE_PERSISTED,
                    job_id = %self.job_id,
                    bytes_read = cumulative.bytes_read,
                    fields_read = cumulative.fields_read,
                    records_read = cumulative.records_read,
                    "usage persisted"
                );
                Ok(cumulative)
            }
            Err(e) => {
                self.bytes_since.fetch_add(delta.bytes_read, Ordering::SeqCst);
                self.fields_since.fetch_add(delta.fields_read, Ordering::SeqCst);
                self.records_since
                    .fetch_add(delta.records_read, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for UsageReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageReporter")
            .field("job_id", &self.job_id)
            .field("interval", &self.interval)
            .field("since_last_report", &self.since_last_report())
            .finish()
    }
}

fn is_milestone(records: u64) -> bool {
    matches!(records, 1 | 10 | 100 | 1_000) || (records > 0 && records % 10_000 == 0)
}

/// Pass-through reader that reports every byte read to a [`UsageReporter`].
///
/// No buffering of its own: each `read` is forwarded once and its count
/// reported as-is, `0` at end of stream.
pub struct CountingReader<R> {
    inner: R,
    usage: Arc<UsageReporter>,
    total: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, usage: Arc<UsageReporter>) -> Self {
        Self {
            inner,
            usage,
            total: 0,
        }
    }

    /// Bytes read through this wrapper.
    pub fn bytes_read(&self) -> u64 {
        self.total
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.total += n as u64;
        self.usage.add_bytes_read(n as u64);
        Ok(n)
    }
}
