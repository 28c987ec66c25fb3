//! Test utilities for aj-core.
//!
//! This module provides test infrastructure including:
//! - Common assertions
//! - A manually advanced clock
//! - In-memory persistence collaborators
//! - A loopback backing process that acknowledges flushes
//! - Test logging

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use aj_common::{FlushId, JobId, Result};

use crate::clock::Clock;
use crate::lifecycle::JobState;
use crate::persistence::{Bucket, PersistError, ResultsStore, UsagePersister};
use crate::process::{parse_output_line, OutputParser, OutputRecord, ProcessInput};
use crate::renormalize::{Normalizer, QuantilesSnapshot};
use crate::status::JobStatusObserver;
use crate::usage::{UsageReporter, UsageTotals};

// ============================================================================
// Macros (must be defined first for use in this module)
// ============================================================================

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("{}: {:?}", $msg, e),
        }
    };
}

/// Assert that a Result is Err.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(val) => panic!("Expected Err, got Ok: {:?}", val),
            Err(_) => {}
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => panic!("{}: got Ok({:?})", $msg, val),
            Err(_) => {}
        }
    };
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Logging and polling
// ============================================================================

/// Install a test-friendly subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aj_core=debug")),
        )
        .try_init();
}

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *lock(&self.offset)
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Records every usage report; can be switched to fail.
#[derive(Debug, Default)]
pub struct MemoryUsagePersister {
    reports: Mutex<Vec<UsageTotals>>,
    failing: AtomicBool,
}

impl MemoryUsagePersister {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<UsageTotals> {
        lock(&self.reports).clone()
    }

    pub fn last(&self) -> Option<UsageTotals> {
        lock(&self.reports).last().copied()
    }
}

impl UsagePersister for MemoryUsagePersister {
    fn persist_usage(&self, _job_id: &JobId, totals: &UsageTotals) -> std::result::Result<(), PersistError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("usage store offline".to_string()));
        }
        lock(&self.reports).push(*totals);
        Ok(())
    }
}

/// In-memory results store.
#[derive(Debug, Default)]
pub struct MemoryResultsStore {
    buckets: Mutex<HashMap<JobId, Vec<Bucket>>>,
    quantiles: Mutex<Vec<QuantilesSnapshot>>,
    updates: Mutex<u64>,
}

impl MemoryResultsStore {
    pub fn insert_bucket(&self, job_id: &JobId, bucket: Bucket) {
        let mut buckets = lock(&self.buckets);
        let list = buckets.entry(job_id.clone()).or_default();
        list.push(bucket);
        list.sort_by_key(|b| b.timestamp_ms);
    }

    pub fn bucket_scores(&self, job_id: &JobId) -> Vec<f64> {
        lock(&self.buckets)
            .get(job_id)
            .map(|list| list.iter().map(|b| b.score).collect())
            .unwrap_or_default()
    }

    pub fn quantiles(&self) -> Vec<QuantilesSnapshot> {
        lock(&self.quantiles).clone()
    }

    pub fn updates(&self) -> u64 {
        *lock(&self.updates)
    }
}

impl ResultsStore for MemoryResultsStore {
    fn persist_quantiles(&self, snapshot: &QuantilesSnapshot) -> std::result::Result<(), PersistError> {
        lock(&self.quantiles).push(snapshot.clone());
        Ok(())
    }

    fn buckets(
        &self,
        job_id: &JobId,
        end_ms: i64,
        skip: usize,
        take: usize,
    ) -> std::result::Result<Vec<Bucket>, PersistError> {
        Ok(lock(&self.buckets)
            .get(job_id)
            .map(|list| {
                list.iter()
                    .filter(|b| b.timestamp_ms <= end_ms)
                    .skip(skip)
                    .take(take)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn update_bucket(&self, job_id: &JobId, bucket: &Bucket) -> std::result::Result<(), PersistError> {
        let mut buckets = lock(&self.buckets);
        let slot = buckets
            .get_mut(job_id)
            .and_then(|list| list.iter_mut().find(|b| b.timestamp_ms == bucket.timestamp_ms))
            .ok_or_else(|| PersistError::Rejected(format!("no bucket at {}", bucket.timestamp_ms)))?;
        *slot = bucket.clone();
        *lock(&self.updates) += 1;
        Ok(())
    }
}

/// Scales each bucket's initial score by the factor in `quantile_state`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalingNormalizer;

impl Normalizer for ScalingNormalizer {
    fn normalize(&self, snapshot: &QuantilesSnapshot, buckets: &[Bucket]) -> Result<Vec<Bucket>> {
        let factor: f64 = snapshot.quantile_state.parse().unwrap_or(1.0);
        Ok(buckets
            .iter()
            .map(|b| Bucket {
                score: b.initial_score * factor,
                ..b.clone()
            })
            .collect())
    }
}

// ============================================================================
// Status
// ============================================================================

/// Records state changes and degradation reports.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    transitions: Mutex<Vec<(JobState, JobState)>>,
    degraded: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn transitions(&self) -> Vec<(JobState, JobState)> {
        lock(&self.transitions).clone()
    }

    pub fn degraded_reasons(&self) -> Vec<String> {
        lock(&self.degraded).clone()
    }
}

impl JobStatusObserver for RecordingObserver {
    fn state_changed(&self, _job_id: &JobId, from: JobState, to: JobState) {
        lock(&self.transitions).push((from, to));
    }

    fn degraded(&self, _job_id: &JobId, reason: &str) {
        lock(&self.degraded).push(reason.to_string());
    }
}

// ============================================================================
// Loopback backing process
// ============================================================================

/// In-process stand-in for the backing process.
///
/// Input records are counted and discarded; flush requests are answered
/// with an acknowledgement on the output unless acknowledgements are
/// disabled. Closing the input ends the output.
pub struct Loopback;

impl Loopback {
    pub fn pair() -> (LoopbackInput, LoopbackOutput, LoopbackHandle) {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(LoopbackShared {
            tx: Mutex::new(Some(tx)),
            ack_flushes: AtomicBool::new(true),
            records: Mutex::new(Vec::new()),
        });
        (
            LoopbackInput {
                shared: shared.clone(),
            },
            LoopbackOutput { rx },
            LoopbackHandle { shared },
        )
    }
}

struct LoopbackShared {
    tx: Mutex<Option<Sender<String>>>,
    ack_flushes: AtomicBool,
    records: Mutex<Vec<String>>,
}

impl LoopbackShared {
    fn emit(&self, line: String) -> bool {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }
}

pub struct LoopbackInput {
    shared: Arc<LoopbackShared>,
}

impl ProcessInput for LoopbackInput {
    fn write_data(&mut self, reader: &mut dyn std::io::Read, usage: &UsageReporter) -> Result<u64> {
        use std::io::BufRead;
        let mut records = 0;
        for line in std::io::BufReader::new(reader).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line)?;
            usage.add_fields_records_read(value.as_object().map_or(0, |o| o.len()) as u64);
            lock(&self.shared.records).push(line);
            records += 1;
        }
        Ok(records)
    }

    fn write_flush(&mut self, flush_id: &FlushId) -> Result<()> {
        if self.shared.ack_flushes.load(Ordering::SeqCst) {
            let ack = serde_json::json!({ "flush": { "id": flush_id.as_str() } });
            self.shared.emit(ack.to_string());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        lock(&self.shared.tx).take();
        Ok(())
    }
}

pub struct LoopbackOutput {
    rx: Receiver<String>,
}

impl OutputParser for LoopbackOutput {
    fn next_record(&mut self) -> Result<Option<OutputRecord>> {
        while let Ok(line) = self.rx.recv() {
            if let Some(record) = parse_output_line(&line)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// Test-side control of a [`Loopback`] process.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<LoopbackShared>,
}

impl LoopbackHandle {
    /// Stop answering flush requests.
    pub fn set_ack_flushes(&self, ack: bool) {
        self.shared.ack_flushes.store(ack, Ordering::SeqCst);
    }

    /// Emit a raw output line. Returns `false` once the output has ended.
    pub fn emit(&self, line: impl Into<String>) -> bool {
        self.shared.emit(line.into())
    }

    pub fn emit_quantiles(&self, snapshot: &QuantilesSnapshot) -> bool {
        let line = serde_json::json!({ "quantiles": snapshot }).to_string();
        self.emit(line)
    }

    /// Simulate the process dying: its output ends.
    pub fn kill(&self) {
        lock(&self.shared.tx).take();
    }

    /// Input records received so far.
    pub fn records(&self) -> Vec<String> {
        lock(&self.shared.records).clone()
    }
}
