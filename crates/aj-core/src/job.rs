//! A running analytics job.
//!
//! [`AnalyticsJob`] owns one backing process and everything attached to it:
//! the lifecycle, usage accounting, the flush coordinator, the result-reader
//! thread, the renormalizer and the periodic usage tick.
//!
//! ```ignore
//! let job = AnalyticsJob::open(job_id, config, collaborators, input, output)?;
//! job.ingest(reader)?;
//! job.flush()?;
//! let totals = job.close()?;
//! ```

use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aj_common::{Error, FlushId, JobId, Result};
use aj_config::CoreConfig;
use tracing::{debug, error, info, warn};

use crate::chunking::{ChunkPlan, DataExtractor, DataSummary, LookbackRunner, LookbackSink, LookbackStats};
use crate::clock::{Clock, SystemClock};
use crate::flush::FlushCoordinator;
use crate::lifecycle::{JobLifecycle, JobState};
use crate::logging::event_names;
use crate::persistence::{ResultsStore, UsagePersister};
use crate::process::{OutputParser, ProcessInput, ResultReader, ResultSinks};
use crate::realtime::{RealtimeScheduler, RealtimeSearch};
use crate::renormalize::{renormalizer_from_config, Normalizer, Renormalizer};
use crate::scheduler::{NextRun, PeriodicTaskRunner};
use crate::status::{JobStatusObserver, LoggingStatusObserver};
use crate::usage::{CountingReader, UsageReporter, UsageTotals};

/// External services a job talks to.
#[derive(Clone)]
pub struct JobCollaborators {
    pub usage_persister: Arc<dyn UsagePersister>,
    pub results_store: Arc<dyn ResultsStore>,
    pub normalizer: Arc<dyn Normalizer>,
    pub observer: Arc<dyn JobStatusObserver>,
    pub clock: Arc<dyn Clock>,
}

impl JobCollaborators {
    /// Collaborators with a logging status observer and the system clock.
    pub fn new(
        usage_persister: Arc<dyn UsagePersister>,
        results_store: Arc<dyn ResultsStore>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Self {
        Self {
            usage_persister,
            results_store,
            normalizer,
            observer: Arc::new(LoggingStatusObserver),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobStatusObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// An open job bound to one backing process.
pub struct AnalyticsJob {
    job_id: JobId,
    config: CoreConfig,
    lifecycle: JobLifecycle,
    observer: Arc<dyn JobStatusObserver>,
    usage: Arc<UsageReporter>,
    flush: Arc<FlushCoordinator>,
    renormalizer: Arc<dyn Renormalizer>,
    input: Mutex<Box<dyn ProcessInput>>,
    reader: Mutex<Option<ResultReader>>,
    usage_runner: PeriodicTaskRunner,
}

impl AnalyticsJob {
    /// Open a job over an already-started backing process.
    ///
    /// If any component fails to start the job is moved to `Failed` (seen by
    /// the status observer) and the error is returned.
    pub fn open(
        job_id: JobId,
        config: CoreConfig,
        collaborators: JobCollaborators,
        input: Box<dyn ProcessInput>,
        output: Box<dyn OutputParser>,
    ) -> Result<Self> {
        let lifecycle =
            JobLifecycle::new(job_id.clone()).with_observer(Arc::clone(&collaborators.observer));
        lifecycle.transition(JobState::Opening)?;

        let usage = Arc::new(UsageReporter::new(
            job_id.clone(),
            &config.usage,
            Arc::clone(&collaborators.usage_persister),
            Arc::clone(&collaborators.observer),
            Arc::clone(&collaborators.clock),
        ));
        let flush = Arc::new(FlushCoordinator::new(job_id.clone()));

        let started = Self::start_components(&job_id, &config, &collaborators, &usage, &flush, output);
        let (renormalizer, reader, usage_runner) = match started {
            Ok(parts) => parts,
            Err(e) => {
                flush.clear();
                error!(
                    event = event_names::JOB_FAILED,
                    job_id = %job_id,
                    error = %e,
                    "job failed to open"
                );
                let _ = lifecycle.transition(JobState::Failed);
                return Err(e);
            }
        };

        lifecycle.transition(JobState::Opened)?;
        info!(
            event = event_names::JOB_OPENED,
            job_id = %job_id,
            renormalization = renormalizer.is_enabled(),
            report_interval_ms = config.usage.report_interval_ms,
            "job opened"
        );

        Ok(Self {
            job_id,
            config,
            lifecycle,
            observer: collaborators.observer,
            usage,
            flush,
            renormalizer,
            input: Mutex::new(input),
            reader: Mutex::new(Some(reader)),
            usage_runner,
        })
    }

    fn start_components(
        job_id: &JobId,
        config: &CoreConfig,
        collaborators: &JobCollaborators,
        usage: &Arc<UsageReporter>,
        flush: &Arc<FlushCoordinator>,
        output: Box<dyn OutputParser>,
    ) -> Result<(Arc<dyn Renormalizer>, ResultReader, PeriodicTaskRunner)> {
        let renormalizer = renormalizer_from_config(
            job_id.clone(),
            &config.renormalization,
            Arc::clone(&collaborators.results_store),
            Arc::clone(&collaborators.normalizer),
        )?;

        let reader = ResultReader::start(
            job_id.clone(),
            output,
            ResultSinks {
                flush: Arc::clone(flush),
                store: Arc::clone(&collaborators.results_store),
                renormalizer: Arc::clone(&renormalizer),
                observer: Arc::clone(&collaborators.observer),
            },
        )?;

        let usage_runner = PeriodicTaskRunner::new(format!("usage-{}", job_id));
        let tick_usage = Arc::clone(usage);
        let tick_observer = Arc::clone(&collaborators.observer);
        let tick_job = job_id.clone();
        usage_runner.start(
            move || {
                tick_usage.report_if_due().map(|_| ()).inspect_err(|e| {
                    tick_observer.degraded(&tick_job, &e.to_string());
                })
            },
            NextRun::aligned(config.usage.report_interval(), config.runner.next_task_delay()),
        )?;

        Ok((renormalizer, reader, usage_runner))
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> JobState {
        self.lifecycle.state()
    }

    pub fn is_any_of(&self, candidates: &[JobState]) -> bool {
        self.lifecycle.is_any_of(candidates)
    }

    pub fn usage(&self) -> &Arc<UsageReporter> {
        &self.usage
    }

    pub fn flush_coordinator(&self) -> &Arc<FlushCoordinator> {
        &self.flush
    }

    /// Stream `reader` into the backing process. Returns bytes read.
    pub fn ingest<R: Read>(&self, reader: R) -> Result<u64> {
        self.ensure_opened()?;
        let mut counting = CountingReader::new(reader, Arc::clone(&self.usage));
        let records = self.input().write_data(&mut counting, &self.usage)?;
        debug!(
            job_id = %self.job_id,
            records,
            bytes = counting.bytes_read(),
            "data ingested"
        );
        Ok(counting.bytes_read())
    }

    /// Flush with the configured default timeout.
    pub fn flush(&self) -> Result<FlushId> {
        self.flush_with_timeout(self.config.flush.default_timeout())
    }

    /// Ask the backing process to flush and wait for its acknowledgement.
    pub fn flush_with_timeout(&self, timeout: Duration) -> Result<FlushId> {
        self.ensure_opened()?;
        let flush_id = FlushId::generate();
        debug!(
            event = event_names::FLUSH_REQUESTED,
            job_id = %self.job_id,
            flush_id = %flush_id,
            "flush requested"
        );
        self.input().write_flush(&flush_id)?;
        self.flush.await_flush(&flush_id, timeout)?;
        Ok(flush_id)
    }

    /// Plan a lookback over `[start, end)` using the configured chunk span,
    /// or one estimated from `summary` when none is configured.
    pub fn plan_lookback(&self, start: i64, end: i64, summary: &DataSummary) -> Result<ChunkPlan> {
        let span = self
            .config
            .extraction
            .chunk_span_ms
            .or_else(|| summary.estimate_chunk_span(self.config.extraction.docs_per_chunk));
        ChunkPlan::from_summary(start, end, span, summary)
    }

    /// Run `plan` against `extractor`, feeding pages into this job.
    pub fn run_lookback(&self, plan: ChunkPlan, extractor: &mut dyn DataExtractor) -> Result<LookbackStats> {
        self.ensure_opened()?;
        LookbackRunner::new(self.job_id.clone(), plan, self.config.extraction.flush_after_chunk)
            .run(extractor, self)
    }

    /// Keep extracting live data from `start_ms` onwards, one search per
    /// configured frequency. The job is closed if the search gives up for
    /// lack of data; stopping the returned scheduler leaves the job open.
    pub fn start_realtime<X>(self: &Arc<Self>, extractor: X, start_ms: i64) -> Result<RealtimeScheduler>
    where
        X: DataExtractor + Send + 'static,
    {
        self.ensure_opened()?;
        let search = RealtimeSearch::new(self.job_id.clone(), start_ms, &self.config.realtime);
        let job = Arc::clone(self);
        RealtimeScheduler::start(
            search,
            extractor,
            Arc::clone(self) as Arc<dyn LookbackSink + Send + Sync>,
            self.config.runner.next_task_delay(),
            move || {
                if let Err(e) = job.close() {
                    warn!(job_id = %job.job_id, error = %e, "failed to close job after real-time search ended");
                }
            },
        )
    }

    /// Shut the job down and return the final persisted usage totals.
    ///
    /// Blocks until the backing process ends its output. Any error after
    /// `Closing` is entered moves the job to `Failed`.
    pub fn close(&self) -> Result<UsageTotals> {
        self.lifecycle.transition(JobState::Closing)?;
        match self.shut_down() {
            Ok(totals) => {
                self.lifecycle.transition(JobState::Closed)?;
                info!(
                    event = event_names::JOB_CLOSED,
                    job_id = %self.job_id,
                    bytes_read = totals.bytes_read,
                    records_read = totals.records_read,
                    "job closed"
                );
                Ok(totals)
            }
            Err(e) => {
                error!(
                    event = event_names::JOB_FAILED,
                    job_id = %self.job_id,
                    error = %e,
                    "job failed while closing"
                );
                let _ = self.lifecycle.transition(JobState::Failed);
                self.tear_down(Duration::ZERO);
                Err(e)
            }
        }
    }

    fn shut_down(&self) -> Result<UsageTotals> {
        self.usage_runner.shutdown(self.config.runner.stop_timeout())?;
        self.input().close()?;

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let stats = reader.join()?;
            if stats.failed {
                warn!(job_id = %self.job_id, "backing process output ended with an error");
            }
        }

        self.renormalizer.wait_until_idle();
        if !self.renormalizer.shutdown() {
            return Err(Error::Process("renormalizer worker panicked".to_string()));
        }

        let totals = self.usage.finish()?;
        self.flush.clear();
        Ok(totals)
    }

    /// Mark the job failed and detach it from the backing process.
    ///
    /// Flush waiters are released, and output arriving afterwards is drained
    /// without being persisted or renormalized.
    pub fn fail(&self, reason: &str) -> Result<()> {
        self.lifecycle.transition(JobState::Failed)?;
        self.tear_down(self.config.runner.stop_timeout());
        self.observer.degraded(&self.job_id, reason);
        error!(
            event = event_names::JOB_FAILED,
            job_id = %self.job_id,
            reason,
            "job failed"
        );
        Ok(())
    }

    /// Best-effort release of everything attached to the backing process.
    /// Every step runs regardless of earlier ones; repeating is harmless.
    fn tear_down(&self, wait: Duration) {
        self.flush.clear();
        if !self.usage_runner.stop(wait) {
            warn!(job_id = %self.job_id, "usage runner still stopping");
        }

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = &reader {
            reader.stop_routing();
        }
        if let Err(e) = self.input().close() {
            warn!(job_id = %self.job_id, error = %e, "failed to close process input");
        }
        if !self.renormalizer.shutdown() {
            warn!(job_id = %self.job_id, "renormalizer worker panicked");
        }

        match reader.map(|reader| reader.join_timeout(wait)) {
            None => {}
            Some(Some(Ok(stats))) => debug!(
                job_id = %self.job_id,
                discarded = stats.discarded,
                "result reader finished after failure"
            ),
            Some(Some(Err(e))) => warn!(job_id = %self.job_id, error = %e, "result reader ended badly"),
            Some(None) => warn!(
                job_id = %self.job_id,
                "result reader still draining output; detached"
            ),
        }
    }

    fn ensure_opened(&self) -> Result<()> {
        let state = self.lifecycle.state();
        if state != JobState::Opened {
            return Err(Error::JobNotOpen {
                job_id: self.job_id.to_string(),
                state: state.to_string(),
            });
        }
        Ok(())
    }

    fn input(&self) -> MutexGuard<'_, Box<dyn ProcessInput>> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LookbackSink for AnalyticsJob {
    fn ingest_page(&self, page: &[u8]) -> Result<u64> {
        self.ingest(page)
    }

    fn flush(&self) -> Result<()> {
        AnalyticsJob::flush(self).map(|_| ())
    }
}

impl Drop for AnalyticsJob {
    fn drop(&mut self) {
        if !self.is_any_of(&[JobState::Closed, JobState::Failed]) {
            self.tear_down(Duration::ZERO);
        }
    }
}

impl std::fmt::Debug for AnalyticsJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsJob")
            .field("job_id", &self.job_id)
            .field("state", &self.state())
            .finish()
    }
}
