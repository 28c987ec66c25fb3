//! Real-time extraction.
//!
//! Once historical data has been processed, a job keeps up with live data
//! by searching `[last_end, now - query_delay)` once per frequency, with the
//! window end rounded down to a multiple of the frequency. `last_end` only
//! moves past data that was actually ingested, so a run that hits an
//! extraction or ingestion problem is retried from the same point.
//!
//! [`RealtimeSearch`] holds that state and is driven with an explicit clock
//! value; [`RealtimeScheduler`] drives it from a [`PeriodicTaskRunner`].

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aj_common::time::{format_epoch_ms, now_epoch_ms};
use aj_common::{EpochMillis, Error, JobId, Result};
use aj_config::RealtimeConfig;
use tracing::{debug, info, warn};

use crate::chunking::{DataExtractor, ExtractionChunk, LookbackSink};
use crate::logging::event_names;
use crate::scheduler::{NextRun, PeriodicTaskRunner, RunnerState};

/// Tracks problems within a run and consecutive runs that found no data.
#[derive(Debug)]
pub struct ProblemTracker {
    job_id: JobId,
    max_empty_runs: u32,
    empty_runs: u32,
    problem: Option<String>,
    had_problem: bool,
}

impl ProblemTracker {
    pub fn new(job_id: JobId, max_empty_runs: u32) -> Self {
        Self {
            job_id,
            max_empty_runs: max_empty_runs.max(1),
            empty_runs: 0,
            problem: None,
            had_problem: false,
        }
    }

    /// Record a problem for the current run. Only the first is logged.
    pub fn report_problem(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.problem.is_none() {
            warn!(
                event = event_names::REALTIME_PROBLEM,
                job_id = %self.job_id,
                problem = %message,
                "real-time extraction problem"
            );
        }
        self.problem = Some(message);
    }

    pub fn has_problems(&self) -> bool {
        self.problem.is_some()
    }

    pub fn empty_runs(&self) -> u32 {
        self.empty_runs
    }

    /// Count a run with or without data. Returns `true` once
    /// `max_empty_runs` consecutive runs were empty.
    pub fn update_empty_data_count(&mut self, empty: bool) -> bool {
        if empty {
            self.empty_runs = self.empty_runs.saturating_add(1);
            if self.empty_runs == self.max_empty_runs {
                warn!(
                    event = event_names::REALTIME_NO_DATA,
                    job_id = %self.job_id,
                    empty_runs = self.empty_runs,
                    "no data found in consecutive real-time searches"
                );
            }
        } else {
            self.empty_runs = 0;
        }
        self.empty_runs >= self.max_empty_runs
    }

    /// Close out the current run.
    pub fn finish_report(&mut self) {
        let has_problem = self.problem.take().is_some();
        if self.had_problem && !has_problem {
            info!(
                event = event_names::REALTIME_RECOVERED,
                job_id = %self.job_id,
                "real-time extraction recovered"
            );
        }
        self.had_problem = has_problem;
    }
}

/// Outcome of one real-time run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealtimeRun {
    /// `None` when the clock has not yet moved past the last window.
    pub window: Option<ExtractionChunk>,
    pub pages: u64,
    pub bytes: u64,
    pub problem: bool,
    pub flushed: bool,
    /// Too many consecutive runs found no data.
    pub exhausted: bool,
    /// The sink rejected data because the job is no longer open.
    pub sink_closed: bool,
}

impl RealtimeRun {
    pub fn should_stop(&self) -> bool {
        self.exhausted || self.sink_closed
    }
}

/// Real-time window state for one job.
#[derive(Debug)]
pub struct RealtimeSearch {
    job_id: JobId,
    start_ms: EpochMillis,
    last_end_ms: Option<EpochMillis>,
    frequency_ms: i64,
    query_delay_ms: i64,
    bucket_span_ms: Option<i64>,
    problems: ProblemTracker,
}

impl RealtimeSearch {
    /// The first window starts at `start_ms`.
    pub fn new(job_id: JobId, start_ms: EpochMillis, config: &RealtimeConfig) -> Self {
        let millis = |ms: u64| i64::try_from(ms).unwrap_or(i64::MAX);
        Self {
            problems: ProblemTracker::new(job_id.clone(), config.max_empty_runs),
            job_id,
            start_ms,
            last_end_ms: None,
            frequency_ms: millis(config.frequency_ms).max(1),
            query_delay_ms: millis(config.query_delay_ms),
            bucket_span_ms: config.bucket_span_ms.map(|span| millis(span).max(1)),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms.unsigned_abs())
    }

    /// Exclusive end of the data processed so far, once any has been.
    pub fn last_end_ms(&self) -> Option<EpochMillis> {
        self.last_end_ms
    }

    pub fn problems(&self) -> &ProblemTracker {
        &self.problems
    }

    /// Window a run at `now_ms` would search.
    pub fn next_window(&self, now_ms: EpochMillis) -> Option<ExtractionChunk> {
        let start = self.last_end_ms.unwrap_or(self.start_ms);
        let end = now_ms
            .saturating_sub(self.query_delay_ms)
            .div_euclid(self.frequency_ms)
            .saturating_mul(self.frequency_ms);
        (end > start).then_some(ExtractionChunk {
            start_ms: start,
            end_ms: end,
        })
    }

    /// Search the window due at `now_ms` and feed every page into `sink`.
    ///
    /// Problems are recorded, not returned: the next run retries from the
    /// last point known to be ingested. The sink is flushed whenever that
    /// point moves.
    pub fn run_once(
        &mut self,
        now_ms: EpochMillis,
        extractor: &mut dyn DataExtractor,
        sink: &dyn LookbackSink,
    ) -> RealtimeRun {
        let Some(window) = self.next_window(now_ms) else {
            return RealtimeRun::default();
        };
        debug!(
            event = event_names::REALTIME_WINDOW,
            job_id = %self.job_id,
            start = %format_epoch_ms(window.start_ms),
            end = %format_epoch_ms(window.end_ms),
            "searching real-time window"
        );

        let previous = self.last_end_ms;
        let mut run = RealtimeRun {
            window: Some(window),
            ..RealtimeRun::default()
        };
        let mut latest = None;

        match extractor.new_search(window) {
            Ok(()) => {
                while !self.problems.has_problems() {
                    match extractor.next_page() {
                        Ok(Some(page)) => match sink.ingest_page(&page) {
                            Ok(bytes) => {
                                run.pages += 1;
                                run.bytes += bytes;
                                if let Some(ts) = extractor.latest_record_ms() {
                                    latest = Some(ts);
                                    self.last_end_ms = Some(ts.saturating_add(1));
                                }
                            }
                            Err(e) => {
                                run.sink_closed = matches!(e, Error::JobNotOpen { .. });
                                self.problems.report_problem(format!("ingest failed: {e}"));
                            }
                        },
                        Ok(None) => break,
                        Err(e) => self.problems.report_problem(format!("extraction failed: {e}")),
                    }
                }
            }
            Err(e) => self.problems.report_problem(format!("search failed: {e}")),
        }

        run.problem = self.problems.has_problems();
        if !run.problem {
            if run.pages > 0 {
                let resume = latest.map_or(window.end_ms, |ts| {
                    self.resume_after(ts).min(window.end_ms)
                });
                self.last_end_ms = Some(resume);
            }
            run.exhausted = self.problems.update_empty_data_count(run.pages == 0);
        }
        self.problems.finish_report();

        if self.last_end_ms != previous && !run.sink_closed {
            match sink.flush() {
                Ok(()) => run.flushed = true,
                Err(e) => warn!(
                    job_id = %self.job_id,
                    error = %e,
                    "flush after real-time window failed"
                ),
            }
        }
        run
    }

    /// First instant after `latest`, rounded up to a bucket boundary when a
    /// bucket span is configured.
    fn resume_after(&self, latest: EpochMillis) -> EpochMillis {
        let next = latest.saturating_add(1);
        match self.bucket_span_ms {
            Some(span) => {
                let floor = next.div_euclid(span).saturating_mul(span);
                if floor == next {
                    next
                } else {
                    floor.saturating_add(span)
                }
            }
            None => next,
        }
    }
}

fn lock(search: &Mutex<RealtimeSearch>) -> MutexGuard<'_, RealtimeSearch> {
    search.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a [`RealtimeSearch`] once per frequency on its own thread.
///
/// Stops by itself when the search is exhausted or the sink closes.
pub struct RealtimeScheduler {
    job_id: JobId,
    runner: PeriodicTaskRunner,
    search: Arc<Mutex<RealtimeSearch>>,
    runs: Arc<AtomicU64>,
    exhausted: Arc<AtomicBool>,
}

impl RealtimeScheduler {
    /// Start searching. Runs fire `next_task_delay` after each frequency
    /// boundary; `on_exhausted` runs once, on the scheduler thread, if the
    /// search gives up for lack of data.
    pub fn start<X>(
        search: RealtimeSearch,
        mut extractor: X,
        sink: Arc<dyn LookbackSink + Send + Sync>,
        next_task_delay: Duration,
        on_exhausted: impl FnOnce() + Send + 'static,
    ) -> Result<Self>
    where
        X: DataExtractor + Send + 'static,
    {
        let job_id = search.job_id().clone();
        let frequency = search.frequency();
        let search = Arc::new(Mutex::new(search));
        let runs = Arc::new(AtomicU64::new(0));
        let exhausted = Arc::new(AtomicBool::new(false));
        let runner = PeriodicTaskRunner::new(format!("realtime-{}", job_id));

        let task_search = Arc::clone(&search);
        let task_runs = Arc::clone(&runs);
        let task_exhausted = Arc::clone(&exhausted);
        let task_job = job_id.clone();
        let stop = runner.stop_handle();
        let mut on_exhausted = Some(on_exhausted);
        runner.start(
            move || -> std::result::Result<(), Infallible> {
                let run = lock(&task_search).run_once(now_epoch_ms(), &mut extractor, sink.as_ref());
                if run.window.is_some() {
                    task_runs.fetch_add(1, Ordering::SeqCst);
                }
                if run.should_stop() {
                    stop.request_stop();
                }
                if run.exhausted {
                    task_exhausted.store(true, Ordering::SeqCst);
                    warn!(
                        event = event_names::REALTIME_EXHAUSTED,
                        job_id = %task_job,
                        "stopping real-time extraction: no data"
                    );
                    if let Some(callback) = on_exhausted.take() {
                        callback();
                    }
                }
                Ok(())
            },
            NextRun::aligned(frequency, next_task_delay),
        )?;

        info!(
            event = event_names::REALTIME_STARTED,
            job_id = %job_id,
            frequency_ms = frequency.as_millis() as u64,
            "real-time extraction started"
        );
        Ok(Self {
            job_id,
            runner,
            search,
            runs,
            exhausted,
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Runs that searched a window.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_end_ms(&self) -> Option<EpochMillis> {
        lock(&self.search).last_end_ms()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.runner.state() == RunnerState::Running
    }

    /// See [`PeriodicTaskRunner::stop`].
    pub fn stop(&self, timeout: Duration) -> bool {
        self.runner.stop(timeout)
    }
}

impl std::fmt::Debug for RealtimeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeScheduler")
            .field("job_id", &self.job_id)
            .field("runs", &self.runs())
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}
