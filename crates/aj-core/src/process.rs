//! Backing computation process adapter.
//!
//! The process consumes newline-delimited JSON records on its input and
//! emits newline-delimited JSON results. Control records use the `"."`
//! field; a flush request is `{".":"f<flush id>"}` and is acknowledged on
//! the output with `{"flush":{"id":"<flush id>"}}`.
//!
//! [`ResultReader`] owns the output side on its own thread and routes
//! acknowledgements to the [`FlushCoordinator`] and quantiles to the
//! results store and renormalizer.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aj_common::{Error, FlushId, JobId, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::flush::FlushCoordinator;
use crate::logging::event_names;
use crate::persistence::ResultsStore;
use crate::renormalize::{QuantilesSnapshot, Renormalizer};
use crate::status::JobStatusObserver;
use crate::usage::UsageReporter;

/// Control field name on input records.
pub const CONTROL_FIELD: &str = ".";

/// Prefix of the flush control value.
pub const FLUSH_CONTROL_PREFIX: char = 'f';

/// Input side of the backing process.
pub trait ProcessInput: Send {
    /// Forward records from `reader`, counting fields and records on `usage`.
    /// Returns the number of records written.
    fn write_data(&mut self, reader: &mut dyn Read, usage: &UsageReporter) -> Result<u64>;

    fn write_flush(&mut self, flush_id: &FlushId) -> Result<()>;

    /// Close the input; the process finishes and ends its output.
    fn close(&mut self) -> Result<()>;
}

/// A parsed output record.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    FlushAcknowledgement { id: FlushId },
    Quantiles(QuantilesSnapshot),
    Other(Value),
}

/// Output side of the backing process.
pub trait OutputParser: Send {
    /// Next record, `None` at end of stream.
    fn next_record(&mut self) -> Result<Option<OutputRecord>>;
}

#[derive(Deserialize)]
struct FlushAck {
    id: String,
}

/// Parse one output line. Blank lines yield `None`.
pub fn parse_output_line(line: &str) -> Result<Option<OutputRecord>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line)?;
    if let Some(ack) = value.get("flush") {
        let ack = FlushAck::deserialize(ack)?;
        return Ok(Some(OutputRecord::FlushAcknowledgement {
            id: FlushId::new(ack.id),
        }));
    }
    if let Some(quantiles) = value.get("quantiles") {
        return Ok(Some(OutputRecord::Quantiles(QuantilesSnapshot::deserialize(
            quantiles,
        )?)));
    }
    Ok(Some(OutputRecord::Other(value)))
}

/// Flush control record for `flush_id`.
pub fn flush_control_record(flush_id: &FlushId) -> Value {
    serde_json::json!({ CONTROL_FIELD: format!("{}{}", FLUSH_CONTROL_PREFIX, flush_id) })
}

/// Writes JSON-lines records to a process input.
pub struct JsonLinesInput<W: Write> {
    writer: Option<W>,
}

impl<W: Write> JsonLinesInput<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    fn writer(&mut self) -> Result<&mut W> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::Process("process input already closed".to_string()))
    }
}

impl<W: Write + Send> ProcessInput for JsonLinesInput<W> {
    fn write_data(&mut self, reader: &mut dyn Read, usage: &UsageReporter) -> Result<u64> {
        let writer = self.writer()?;
        let mut records = 0u64;
        for line in BufReader::new(reader).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line)?;
            let fields = value.as_object().map_or(0, |obj| obj.len()) as u64;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            usage.add_fields_records_read(fields);
            records += 1;
        }
        writer.flush()?;
        Ok(records)
    }

    fn write_flush(&mut self, flush_id: &FlushId) -> Result<()> {
        let writer = self.writer()?;
        serde_json::to_writer(&mut *writer, &flush_control_record(flush_id))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Reads JSON-lines records from a process output.
pub struct JsonLinesOutput<R: BufRead> {
    reader: R,
    line: String,
}

impl<R: BufRead> JsonLinesOutput<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl<R: BufRead + Send> OutputParser for JsonLinesOutput<R> {
    fn next_record(&mut self) -> Result<Option<OutputRecord>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            if let Some(record) = parse_output_line(&self.line)? {
                return Ok(Some(record));
            }
        }
    }
}

/// A spawned backing process with JSON-lines pipes.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    /// Spawn `command` with piped stdin/stdout.
    pub fn spawn(
        command: &mut Command,
    ) -> Result<(
        ChildProcess,
        JsonLinesInput<ChildStdin>,
        JsonLinesOutput<BufReader<ChildStdout>>,
    )> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("child stdout not captured".to_string()))?;
        debug!(pid = child.id(), "backing process spawned");
        Ok((
            ChildProcess { child },
            JsonLinesInput::new(stdin),
            JsonLinesOutput::new(BufReader::new(stdout)),
        ))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }

    pub fn kill(&mut self) -> Result<()> {
        Ok(self.child.kill()?)
    }
}

/// Counters from a result-reader run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultReaderStats {
    pub flush_acks: u64,
    pub quantiles: u64,
    pub other: u64,
    /// Records drained after routing was stopped.
    pub discarded: u64,
    pub failed: bool,
}

/// Routes process output on a dedicated thread.
///
/// When the output ends or fails, the flush coordinator is cleared so no
/// caller waits on an acknowledgement that can no longer arrive.
///
/// After [`stop_routing`](Self::stop_routing) the output is still drained
/// to its end but nothing reaches the sinks.
pub struct ResultReader {
    handle: JoinHandle<ResultReaderStats>,
    routing: Arc<AtomicBool>,
    finished: Receiver<()>,
}

/// What the result reader talks to.
#[derive(Clone)]
pub struct ResultSinks {
    pub flush: Arc<FlushCoordinator>,
    pub store: Arc<dyn ResultsStore>,
    pub renormalizer: Arc<dyn Renormalizer>,
    pub observer: Arc<dyn JobStatusObserver>,
}

impl ResultReader {
    pub fn start(
        job_id: JobId,
        mut parser: Box<dyn OutputParser>,
        sinks: ResultSinks,
    ) -> Result<Self> {
        let routing = Arc::new(AtomicBool::new(true));
        let (finished_tx, finished) = mpsc::sync_channel(1);
        let thread_routing = Arc::clone(&routing);
        let handle = thread::Builder::new()
            .name(format!("results-{}", job_id))
            .spawn(move || {
                let stats = read_results(&job_id, parser.as_mut(), &sinks, &thread_routing);
                sinks.flush.clear();
                let _ = finished_tx.send(());
                stats
            })?;
        Ok(Self {
            handle,
            routing,
            finished,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop delivering records to the sinks. Records read from now on are
    /// counted as discarded.
    pub fn stop_routing(&self) {
        self.routing.store(false, Ordering::SeqCst);
    }

    /// Like [`join`](Self::join) but gives up after `timeout`, returning
    /// `None` and leaving the thread to finish on its own.
    pub fn join_timeout(self, timeout: Duration) -> Option<Result<ResultReaderStats>> {
        match self.finished.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Some(self.join()),
            Err(RecvTimeoutError::Timeout) => None,
        }
    }

    /// Wait for the output to end.
    pub fn join(self) -> Result<ResultReaderStats> {
        self.handle
            .join()
            .map_err(|_| Error::Process("result reader thread panicked".to_string()))
    }
}

fn read_results(
    job_id: &JobId,
    parser: &mut dyn OutputParser,
    sinks: &ResultSinks,
    routing: &AtomicBool,
) -> ResultReaderStats {
    let mut stats = ResultReaderStats::default();
    loop {
        let record = parser.next_record();
        if matches!(record, Ok(Some(_))) && !routing.load(Ordering::SeqCst) {
            stats.discarded += 1;
            continue;
        }
        match record {
            Ok(Some(OutputRecord::FlushAcknowledgement { id })) => {
                sinks.flush.acknowledge_flush(&id);
                stats.flush_acks += 1;
            }
            Ok(Some(OutputRecord::Quantiles(snapshot))) => {
                stats.quantiles += 1;
                if let Err(e) = sinks.store.persist_quantiles(&snapshot) {
                    warn!(
                        event = event_names::QUANTILES_PERSIST_FAILED,
                        job_id = %job_id,
                        error = %e,
                        "failed to persist quantiles"
                    );
                    sinks.observer.degraded(job_id, &e.to_string());
                }
                sinks.renormalizer.renormalize(snapshot);
            }
            Ok(Some(OutputRecord::Other(_))) => stats.other += 1,
            Ok(None) => {
                info!(
                    event = event_names::RESULTS_EOF,
                    job_id = %job_id,
                    flush_acks = stats.flush_acks,
                    quantiles = stats.quantiles,
                    discarded = stats.discarded,
                    "backing process output ended"
                );
                break;
            }
            Err(e) => {
                error!(
                    event = event_names::RESULTS_PARSE_FAILED,
                    job_id = %job_id,
                    error = %e,
                    "failed to read backing process output"
                );
                sinks.observer.degraded(job_id, &e.to_string());
                stats.failed = true;
                break;
            }
        }
    }
    stats
}
