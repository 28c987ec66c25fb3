//! Chunked historical extraction.
//!
//! A [`ChunkPlan`] splits `[start, end)` into contiguous half-open chunks of
//! at most `span` milliseconds. [`LookbackRunner`] feeds the chunks through
//! a [`DataExtractor`] into the job one at a time, so no single upstream
//! query covers more than one chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aj_common::time::format_epoch_ms;
use aj_common::{EpochMillis, Error, JobId, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::logging::event_names;

/// Half-open time interval `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractionChunk {
    pub start_ms: EpochMillis,
    pub end_ms: EpochMillis,
}

impl ExtractionChunk {
    /// Length in milliseconds; exact for any pair of `i64` bounds.
    pub fn width(&self) -> u64 {
        self.end_ms.abs_diff(self.start_ms)
    }
}

/// Summary of the data available upstream for a time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSummary {
    pub earliest_ms: EpochMillis,
    pub latest_ms: EpochMillis,
    pub total_hits: u64,
}

impl DataSummary {
    pub fn has_data(&self) -> bool {
        self.total_hits > 0
    }

    /// Span that would put roughly `docs_per_chunk` documents in each chunk,
    /// assuming documents are spread evenly. `None` when there is no data.
    pub fn estimate_chunk_span(&self, docs_per_chunk: u64) -> Option<i64> {
        if !self.has_data() || docs_per_chunk == 0 {
            return None;
        }
        let range = (i128::from(self.latest_ms) - i128::from(self.earliest_ms) + 1).max(1);
        let span = range
            .checked_mul(i128::from(docs_per_chunk))
            .map_or(i128::MAX, |docs| docs / i128::from(self.total_hits));
        Some(span.clamp(1, i128::from(i64::MAX)) as i64)
    }
}

/// Validated chunking of `[start, end)`.
///
/// Iterating yields chunks in time order; the plan can be iterated again
/// from the beginning any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    start: EpochMillis,
    end: EpochMillis,
    span: Option<i64>,
}

impl ChunkPlan {
    /// `span = None` produces a single chunk covering the whole range.
    pub fn new(start: EpochMillis, end: EpochMillis, span: Option<i64>) -> Result<Self> {
        if start > end || matches!(span, Some(s) if s <= 0) {
            return Err(Error::InvalidChunkRange { start, end, span });
        }
        Ok(Self { start, end, span })
    }

    /// Plan over the part of `[start, end)` that actually holds data.
    ///
    /// The range is narrowed to `[max(start, earliest), min(end, latest + 1))`;
    /// an empty summary gives an empty plan.
    pub fn from_summary(
        start: EpochMillis,
        end: EpochMillis,
        span: Option<i64>,
        summary: &DataSummary,
    ) -> Result<Self> {
        let plan = Self::new(start, end, span)?;
        if !summary.has_data() {
            return Ok(Self { end: start, ..plan });
        }
        let narrowed_start = start.max(summary.earliest_ms);
        let narrowed_end = end.min(summary.latest_ms.saturating_add(1));
        if narrowed_start >= narrowed_end {
            return Ok(Self { end: start, ..plan });
        }
        Ok(Self {
            start: narrowed_start,
            end: narrowed_end,
            span,
        })
    }

    pub fn start(&self) -> EpochMillis {
        self.start
    }

    pub fn end(&self) -> EpochMillis {
        self.end
    }

    pub fn span(&self) -> Option<i64> {
        self.span
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn chunks(&self) -> Chunks {
        Chunks {
            next_start: self.start,
            end: self.end,
            span: self.span,
        }
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = ExtractionChunk;
    type IntoIter = Chunks;

    fn into_iter(self) -> Chunks {
        self.chunks()
    }
}

/// Lazy iterator over a [`ChunkPlan`].
#[derive(Debug, Clone)]
pub struct Chunks {
    next_start: EpochMillis,
    end: EpochMillis,
    span: Option<i64>,
}

impl Iterator for Chunks {
    type Item = ExtractionChunk;

    fn next(&mut self) -> Option<ExtractionChunk> {
        if self.next_start >= self.end {
            return None;
        }
        let chunk_end = match self.span {
            Some(span) => self.next_start.saturating_add(span).min(self.end),
            None => self.end,
        };
        let chunk = ExtractionChunk {
            start_ms: self.next_start,
            end_ms: chunk_end,
        };
        self.next_start = chunk_end;
        Some(chunk)
    }
}

impl std::iter::FusedIterator for Chunks {}

/// Upstream data source queried one chunk at a time.
pub trait DataExtractor {
    /// Begin a search over `chunk`, discarding any previous search.
    fn new_search(&mut self, chunk: ExtractionChunk) -> Result<()>;

    /// Next page of raw input for the current search, `None` when exhausted.
    fn next_page(&mut self) -> Result<Option<Vec<u8>>>;

    /// Timestamp of the newest record handed out by the current search,
    /// if the source tracks it.
    fn latest_record_ms(&self) -> Option<EpochMillis> {
        None
    }
}

/// Where extracted pages go.
pub trait LookbackSink {
    /// Ingest one page, returning bytes consumed.
    fn ingest_page(&self, page: &[u8]) -> Result<u64>;

    fn flush(&self) -> Result<()>;
}

/// Shared cancellation flag for a lookback run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters from a lookback run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookbackStats {
    pub chunks: u64,
    pub pages: u64,
    pub bytes: u64,
    pub flushes: u64,
    pub cancelled: bool,
}

/// Drives chunk → pages → ingestion → optional flush, strictly in order.
#[derive(Debug)]
pub struct LookbackRunner {
    job_id: JobId,
    plan: ChunkPlan,
    flush_after_chunk: bool,
    cancel: CancelHandle,
}

impl LookbackRunner {
    pub fn new(job_id: JobId, plan: ChunkPlan, flush_after_chunk: bool) -> Self {
        Self {
            job_id,
            plan,
            flush_after_chunk,
            cancel: CancelHandle::default(),
        }
    }

    /// Handle to stop the run between pages from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the plan to completion, cancellation, or the first error.
    pub fn run(
        &self,
        extractor: &mut dyn DataExtractor,
        sink: &dyn LookbackSink,
    ) -> Result<LookbackStats> {
        let mut stats = LookbackStats::default();
        info!(
            event = event_names::LOOKBACK_STARTED,
            job_id = %self.job_id,
            start = %format_epoch_ms(self.plan.start()),
            end = %format_epoch_ms(self.plan.end()),
            span_ms = ?self.plan.span(),
            "lookback started"
        );

        'chunks: for chunk in self.plan.chunks() {
            if self.cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            debug!(
                event = event_names::CHUNK_STARTED,
                job_id = %self.job_id,
                chunk_start = chunk.start_ms,
                chunk_end = chunk.end_ms,
                "extracting chunk"
            );

            extractor.new_search(chunk)?;
            while let Some(page) = extractor.next_page()? {
                if self.cancel.is_cancelled() {
                    stats.cancelled = true;
                    break 'chunks;
                }
                stats.bytes += sink.ingest_page(&page)?;
                stats.pages += 1;
            }
            stats.chunks += 1;

            if self.flush_after_chunk {
                sink.flush()?;
                stats.flushes += 1;
            }
        }

        info!(
            event = event_names::LOOKBACK_FINISHED,
            job_id = %self.job_id,
            chunks = stats.chunks,
            pages = stats.pages,
            bytes = stats.bytes,
            cancelled = stats.cancelled,
            "lookback finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn collect(plan: &ChunkPlan) -> Vec<(i64, i64)> {
        plan.chunks().map(|c| (c.start_ms, c.end_ms)).collect()
    }

    #[test]
    fn test_scenario_0_1000_300() {
        let plan = ChunkPlan::new(0, 1000, Some(300)).unwrap();
        assert_eq!(
            collect(&plan),
            vec![(0, 300), (300, 600), (600, 900), (900, 1000)]
        );
    }

    #[test]
    fn test_restartable() {
        let plan = ChunkPlan::new(0, 1000, Some(300)).unwrap();
        assert_eq!(collect(&plan), collect(&plan));
        assert_eq!((&plan).into_iter().count(), 4);
    }

    #[test]
    fn test_unchunked() {
        let plan = ChunkPlan::new(5, 99, None).unwrap();
        assert_eq!(collect(&plan), vec![(5, 99)]);
    }

    #[test]
    fn test_empty_range() {
        assert!(collect(&ChunkPlan::new(7, 7, Some(3)).unwrap()).is_empty());
        assert!(collect(&ChunkPlan::new(7, 7, None).unwrap()).is_empty());
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(matches!(
            ChunkPlan::new(10, 0, Some(1)),
            Err(Error::InvalidChunkRange { .. })
        ));
        assert!(ChunkPlan::new(0, 10, Some(0)).is_err());
        assert!(ChunkPlan::new(0, 10, Some(-1)).is_err());
    }

    #[test]
    fn test_no_overflow_near_max() {
        let plan = ChunkPlan::new(i64::MAX - 10, i64::MAX, Some(i64::MAX)).unwrap();
        assert_eq!(collect(&plan), vec![(i64::MAX - 10, i64::MAX)]);
    }

    #[test]
    fn test_from_summary_narrows() {
        let summary = DataSummary {
            earliest_ms: 250,
            latest_ms: 749,
            total_hits: 10,
        };
        let plan = ChunkPlan::from_summary(0, 1000, Some(200), &summary).unwrap();
        assert_eq!(
            collect(&plan),
            vec![(250, 450), (450, 650), (650, 750)]
        );
    }

    #[test]
    fn test_from_summary_without_hits_is_empty() {
        let summary = DataSummary {
            earliest_ms: 0,
            latest_ms: 0,
            total_hits: 0,
        };
        let plan = ChunkPlan::from_summary(0, 1000, Some(200), &summary).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.chunks().count(), 0);
    }

    #[test]
    fn test_estimate_chunk_span() {
        let summary = DataSummary {
            earliest_ms: 0,
            latest_ms: 999_999,
            total_hits: 100_000,
        };
        assert_eq!(summary.estimate_chunk_span(10_000), Some(100_000));
        assert_eq!(summary.estimate_chunk_span(1), Some(10));

        let sparse = DataSummary {
            earliest_ms: 0,
            latest_ms: 9,
            total_hits: 1_000,
        };
        assert_eq!(sparse.estimate_chunk_span(1), Some(1));
    }

    #[test]
    fn test_estimate_chunk_span_saturates_on_extreme_inputs() {
        let summary = DataSummary {
            earliest_ms: i64::MIN,
            latest_ms: i64::MAX,
            total_hits: 1,
        };
        assert_eq!(summary.estimate_chunk_span(u64::MAX), Some(i64::MAX));
    }

    #[test]
    fn test_full_range_width() {
        let plan = ChunkPlan::new(i64::MIN, i64::MAX, None).unwrap();
        let chunks: Vec<_> = plan.chunks().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].width(), u64::MAX);

        let plan = ChunkPlan::new(i64::MIN, i64::MAX, Some(i64::MAX)).unwrap();
        let total: u128 = plan.chunks().map(|c| u128::from(c.width())).sum();
        assert_eq!(total, u128::from(u64::MAX));
    }

    struct FakeExtractor {
        pages_per_chunk: usize,
        searches: Vec<ExtractionChunk>,
        pending: VecDeque<Vec<u8>>,
    }

    impl DataExtractor for FakeExtractor {
        fn new_search(&mut self, chunk: ExtractionChunk) -> Result<()> {
            self.searches.push(chunk);
            self.pending = (0..self.pages_per_chunk)
                .map(|i| format!("{}:{}\n", chunk.start_ms, i).into_bytes())
                .collect();
            Ok(())
        }

        fn next_page(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.pending.pop_front())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: RefCell<Vec<String>>,
        cancel_after_pages: Option<(usize, CancelHandle)>,
    }

    impl LookbackSink for RecordingSink {
        fn ingest_page(&self, page: &[u8]) -> Result<u64> {
            let mut events = self.events.borrow_mut();
            events.push(String::from_utf8_lossy(page).trim().to_string());
            if let Some((n, cancel)) = &self.cancel_after_pages {
                if events.len() >= *n {
                    cancel.cancel();
                }
            }
            Ok(page.len() as u64)
        }

        fn flush(&self) -> Result<()> {
            self.events.borrow_mut().push("flush".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_lookback_runs_chunks_in_order_with_flushes() {
        let plan = ChunkPlan::new(0, 1000, Some(300)).unwrap();
        let runner = LookbackRunner::new(JobId::new("lookback"), plan, true);
        let mut extractor = FakeExtractor {
            pages_per_chunk: 2,
            searches: Vec::new(),
            pending: VecDeque::new(),
        };
        let sink = RecordingSink::default();

        let stats = runner.run(&mut extractor, &sink).unwrap();
        assert_eq!(stats.chunks, 4);
        assert_eq!(stats.pages, 8);
        assert_eq!(stats.flushes, 4);
        assert!(!stats.cancelled);
        assert_eq!(extractor.searches, plan.chunks().collect::<Vec<_>>());
        assert_eq!(
            sink.events.borrow()[..3],
            ["0:0".to_string(), "0:1".to_string(), "flush".to_string()]
        );
    }

    #[test]
    fn test_lookback_cancel_between_pages() {
        let plan = ChunkPlan::new(0, 1000, Some(300)).unwrap();
        let runner = LookbackRunner::new(JobId::new("lookback"), plan, false);
        let mut extractor = FakeExtractor {
            pages_per_chunk: 2,
            searches: Vec::new(),
            pending: VecDeque::new(),
        };
        let sink = RecordingSink {
            events: RefCell::new(Vec::new()),
            cancel_after_pages: Some((3, runner.cancel_handle())),
        };

        let stats = runner.run(&mut extractor, &sink).unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.pages, 3);
        assert_eq!(extractor.searches.len(), 2);
    }

    #[test]
    fn test_lookback_stops_at_first_error() {
        struct Failing;
        impl DataExtractor for Failing {
            fn new_search(&mut self, _chunk: ExtractionChunk) -> Result<()> {
                Err(Error::Extraction("search rejected".into()))
            }
            fn next_page(&mut self) -> Result<Option<Vec<u8>>> {
                Ok(None)
            }
        }

        let plan = ChunkPlan::new(0, 10, Some(5)).unwrap();
        let runner = LookbackRunner::new(JobId::new("lookback"), plan, true);
        let sink = RecordingSink::default();
        let err = runner.run(&mut Failing, &sink).unwrap_err();
        assert_eq!(err.code(), 51);
        assert!(sink.events.borrow().is_empty());
    }
}
