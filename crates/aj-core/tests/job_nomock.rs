//! End-to-end job behaviour against an in-process backing process and a
//! real child process.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aj_config::CoreConfig;
use aj_core::chunking::{DataExtractor, ExtractionChunk};
use aj_core::persistence::Bucket;
use aj_core::process::ProcessInput;
use aj_core::test_utils::{
    init_test_logging, wait_until, Loopback, LoopbackHandle, LoopbackInput, MemoryResultsStore,
    MemoryUsagePersister, RecordingObserver, ScalingNormalizer,
};
use aj_core::{
    AnalyticsJob, ChunkPlan, DataSummary, Error, FlushId, JobCollaborators, JobId, JobState,
    QuantilesSnapshot, Result, UsageReporter, UsageTotals,
};

struct Harness {
    job: AnalyticsJob,
    loopback: LoopbackHandle,
    persister: Arc<MemoryUsagePersister>,
    store: Arc<MemoryResultsStore>,
    observer: Arc<RecordingObserver>,
}

fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.flush.default_timeout_ms = 5_000;
    config.runner.stop_timeout_ms = 5_000;
    config
}

fn harness_with(config: CoreConfig, store: Arc<MemoryResultsStore>) -> Harness {
    init_test_logging();
    let persister = Arc::new(MemoryUsagePersister::default());
    let observer = Arc::new(RecordingObserver::default());
    let collaborators =
        JobCollaborators::new(persister.clone(), store.clone(), Arc::new(ScalingNormalizer))
            .with_observer(observer.clone());
    let (input, output, loopback) = Loopback::pair();
    let job = AnalyticsJob::open(
        JobId::new("job-e2e"),
        config,
        collaborators,
        Box::new(input),
        Box::new(output),
    )
    .unwrap();
    Harness {
        job,
        loopback,
        persister,
        store,
        observer,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), Arc::new(MemoryResultsStore::default()))
}

#[test]
fn ingest_flush_close_round_trip() {
    let h = harness();
    let data = "{\"host\":\"a\",\"value\":1}\n{\"host\":\"b\",\"value\":2}\n";

    assert_eq!(h.job.ingest(data.as_bytes()).unwrap(), data.len() as u64);
    let flush_id = h.job.flush().unwrap();
    assert!(flush_id.as_str().starts_with("flush-"));
    assert_eq!(h.job.flush_coordinator().pending(), 0);

    let totals = h.job.close().unwrap();
    assert_eq!(totals, UsageTotals::new(data.len() as u64, 4, 2));
    assert_eq!(h.persister.last(), Some(totals));
    assert_eq!(h.job.state(), JobState::Closed);
    assert_eq!(
        h.observer.transitions(),
        vec![
            (JobState::Closed, JobState::Opening),
            (JobState::Opening, JobState::Opened),
            (JobState::Opened, JobState::Closing),
            (JobState::Closing, JobState::Closed),
        ]
    );
}

#[test]
fn unacknowledged_flush_times_out_and_job_stays_open() {
    let h = harness();
    h.loopback.set_ack_flushes(false);

    let err = h
        .job
        .flush_with_timeout(Duration::from_millis(50))
        .unwrap_err();
    assert_eq!(err.code(), 20);
    assert!(h.job.is_any_of(&[JobState::Opened]));
    assert_eq!(h.job.flush_coordinator().pending(), 0);

    h.loopback.set_ack_flushes(true);
    h.job.flush().unwrap();
    h.job.close().unwrap();
}

#[test]
fn process_death_releases_flush_waiters() {
    let h = harness();
    h.loopback.set_ack_flushes(false);
    h.loopback.kill();
    assert!(wait_until(Duration::from_secs(5), || h
        .job
        .flush_coordinator()
        .is_cleared()));

    let err = h
        .job
        .flush_with_timeout(Duration::from_secs(10))
        .unwrap_err();
    assert_eq!(err.code(), 21);

    h.job.fail("backing process exited").unwrap();
    assert_eq!(h.job.state(), JobState::Failed);
    assert_eq!(h.observer.degraded_reasons(), vec!["backing process exited"]);
}

#[test]
fn quantiles_are_persisted_and_scores_renormalized() {
    let store = Arc::new(MemoryResultsStore::default());
    let job_id = JobId::new("job-e2e");
    for ts in 0..5 {
        store.insert_bucket(
            &job_id,
            Bucket {
                timestamp_ms: ts * 1_000,
                initial_score: 10.0,
                score: 10.0,
            },
        );
    }
    let h = harness_with(test_config(), store);

    assert!(h.loopback.emit_quantiles(&QuantilesSnapshot {
        job_id: job_id.clone(),
        timestamp_ms: 2_000,
        quantile_state: "2".to_string(),
    }));
    h.job.close().unwrap();

    assert_eq!(h.store.quantiles().len(), 1);
    assert_eq!(h.store.bucket_scores(&job_id), vec![20.0, 20.0, 20.0, 10.0, 10.0]);
    assert_eq!(h.store.updates(), 3);
}

#[test]
fn disabled_renormalization_leaves_scores() {
    let store = Arc::new(MemoryResultsStore::default());
    let job_id = JobId::new("job-e2e");
    store.insert_bucket(
        &job_id,
        Bucket {
            timestamp_ms: 0,
            initial_score: 1.0,
            score: 1.0,
        },
    );
    let mut config = test_config();
    config.renormalization.enabled = false;
    let h = harness_with(config, store);

    h.loopback.emit_quantiles(&QuantilesSnapshot {
        job_id: job_id.clone(),
        timestamp_ms: 5_000,
        quantile_state: "3".to_string(),
    });
    h.job.close().unwrap();

    assert_eq!(h.store.quantiles().len(), 1);
    assert_eq!(h.store.bucket_scores(&job_id), vec![1.0]);
}

fn store_with_bucket(job_id: &JobId, score: f64) -> Arc<MemoryResultsStore> {
    let store = Arc::new(MemoryResultsStore::default());
    store.insert_bucket(
        job_id,
        Bucket {
            timestamp_ms: 0,
            initial_score: score,
            score,
        },
    );
    store
}

fn tripling_quantiles(job_id: &JobId) -> QuantilesSnapshot {
    QuantilesSnapshot {
        job_id: job_id.clone(),
        timestamp_ms: 1_000,
        quantile_state: "3".to_string(),
    }
}

#[test]
fn failed_job_no_longer_persists_or_rescores() {
    let job_id = JobId::new("job-e2e");
    let h = harness_with(test_config(), store_with_bucket(&job_id, 10.0));

    h.job.fail("backing process wedged").unwrap();

    // The process input was closed, so its output has ended.
    assert!(!h.loopback.emit_quantiles(&tripling_quantiles(&job_id)));
    assert!(h.store.quantiles().is_empty());
    assert_eq!(h.store.bucket_scores(&job_id), vec![10.0]);
    assert_eq!(h.job.close().unwrap_err().code(), 10);
}

/// Input whose close always fails, leaving the process output open.
struct StuckInput(LoopbackInput);

impl ProcessInput for StuckInput {
    fn write_data(&mut self, reader: &mut dyn Read, usage: &UsageReporter) -> Result<u64> {
        self.0.write_data(reader, usage)
    }

    fn write_flush(&mut self, flush_id: &FlushId) -> Result<()> {
        self.0.write_flush(flush_id)
    }

    fn close(&mut self) -> Result<()> {
        Err(Error::Process("input pipe wedged".to_string()))
    }
}

#[test]
fn failed_close_detaches_from_process_output() {
    init_test_logging();
    let job_id = JobId::new("job-stuck");
    let store = store_with_bucket(&job_id, 10.0);
    let (input, output, loopback) = Loopback::pair();
    let job = AnalyticsJob::open(
        job_id.clone(),
        test_config(),
        JobCollaborators::new(
            Arc::new(MemoryUsagePersister::default()),
            store.clone(),
            Arc::new(ScalingNormalizer),
        ),
        Box::new(StuckInput(input)),
        Box::new(output),
    )
    .unwrap();

    assert_eq!(job.close().unwrap_err().code(), 60);
    assert_eq!(job.state(), JobState::Failed);
    assert!(job.flush_coordinator().is_cleared());

    // Output is still open, but nothing read from it reaches the store.
    assert!(loopback.emit_quantiles(&tripling_quantiles(&job_id)));
    loopback.kill();
    thread::sleep(Duration::from_millis(50));
    assert!(store.quantiles().is_empty());
    assert_eq!(store.bucket_scores(&job_id), vec![10.0]);
}

struct PagedSource {
    chunks: Vec<ExtractionChunk>,
    pages_left: usize,
}

impl DataExtractor for PagedSource {
    fn new_search(&mut self, chunk: ExtractionChunk) -> Result<()> {
        self.chunks.push(chunk);
        self.pages_left = 2;
        Ok(())
    }

    fn next_page(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pages_left == 0 {
            return Ok(None);
        }
        self.pages_left -= 1;
        let chunk = self.chunks[self.chunks.len() - 1];
        Ok(Some(
            format!("{{\"time\":{},\"page\":{}}}\n", chunk.start_ms, self.pages_left).into_bytes(),
        ))
    }
}

#[test]
fn lookback_streams_chunks_through_the_job() {
    let h = harness();
    let plan = ChunkPlan::new(0, 1_000, Some(300)).unwrap();
    let mut source = PagedSource {
        chunks: Vec::new(),
        pages_left: 0,
    };

    let stats = h.job.run_lookback(plan, &mut source).unwrap();

    let bounds: Vec<_> = source.chunks.iter().map(|c| (c.start_ms, c.end_ms)).collect();
    assert_eq!(bounds, vec![(0, 300), (300, 600), (600, 900), (900, 1_000)]);
    assert_eq!(stats.chunks, 4);
    assert_eq!(stats.pages, 8);
    assert_eq!(stats.flushes, 4);
    assert_eq!(h.loopback.records().len(), 8);
    assert_eq!(h.job.usage().lifetime_totals().records_read, 8);
    h.job.close().unwrap();
}

#[test]
fn lookback_plan_uses_configured_or_estimated_span() {
    let summary = DataSummary {
        earliest_ms: 100,
        latest_ms: 899,
        total_hits: 80,
    };

    let mut config = test_config();
    config.extraction.chunk_span_ms = Some(250);
    let h = harness_with(config, Arc::new(MemoryResultsStore::default()));
    let plan = h.job.plan_lookback(0, 10_000, &summary).unwrap();
    assert_eq!((plan.start(), plan.end(), plan.span()), (100, 900, Some(250)));
    h.job.close().unwrap();

    let mut config = test_config();
    config.extraction.chunk_span_ms = None;
    config.extraction.docs_per_chunk = 20;
    let h = harness_with(config, Arc::new(MemoryResultsStore::default()));
    let plan = h.job.plan_lookback(0, 10_000, &summary).unwrap();
    assert_eq!(plan.span(), Some(200));
    assert_eq!(plan.chunks().count(), 4);
    h.job.close().unwrap();
}

#[cfg(unix)]
#[test]
fn child_process_job_closes_cleanly() {
    use aj_core::process::ChildProcess;
    use std::process::Command;

    init_test_logging();
    let (mut child, input, output) = ChildProcess::spawn(&mut Command::new("cat")).unwrap();
    let persister = Arc::new(MemoryUsagePersister::default());
    let job = AnalyticsJob::open(
        JobId::new("job-child"),
        test_config(),
        JobCollaborators::new(
            persister.clone(),
            Arc::new(MemoryResultsStore::default()),
            Arc::new(ScalingNormalizer),
        ),
        Box::new(input),
        Box::new(output),
    )
    .unwrap();

    job.ingest("{\"a\":1}\n{\"b\":2}\n".as_bytes()).unwrap();
    let totals = job.close().unwrap();
    assert_eq!(totals.records_read, 2);
    assert!(child.wait().unwrap().success());
}
