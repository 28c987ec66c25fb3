//! Usage accounting with real threads, clocks and files.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aj_config::UsageConfig;
use aj_core::clock::SystemClock;
use aj_core::persistence::{PersistError, UsagePersister};
use aj_core::status::LoggingStatusObserver;
use aj_core::test_utils::{ManualClock, MemoryUsagePersister, RecordingObserver};
use aj_core::{CountingReader, JobId, UsageReporter, UsageTotals};

fn config(interval_ms: u64) -> UsageConfig {
    UsageConfig {
        report_interval_ms: interval_ms,
        log_milestones: true,
    }
}

#[test]
fn concurrent_increments_are_never_lost() {
    let persister = Arc::new(MemoryUsagePersister::default());
    let usage = Arc::new(UsageReporter::new(
        JobId::new("usage-threads"),
        &config(1),
        persister.clone(),
        Arc::new(LoggingStatusObserver),
        Arc::new(SystemClock),
    ));

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let usage = Arc::clone(&usage);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    usage.add_bytes_read(3);
                    usage.add_fields_records_read(2);
                }
            })
        })
        .collect();
    let ticker = {
        let usage = Arc::clone(&usage);
        thread::spawn(move || {
            for _ in 0..50 {
                let _ = usage.report_if_due();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    for writer in writers {
        writer.join().unwrap();
    }
    ticker.join().unwrap();

    let expected = UsageTotals::new(4 * 2_000 * 3, 4 * 2_000 * 2, 4 * 2_000);
    assert_eq!(usage.lifetime_totals(), expected);
    assert_eq!(usage.finish().unwrap(), expected);
    assert_eq!(persister.last(), Some(expected));
    assert_eq!(usage.since_last_report(), UsageTotals::default());

    // Persisted totals only ever grow.
    let reports = persister.reports();
    for pair in reports.windows(2) {
        assert!(pair[0].bytes_read <= pair[1].bytes_read);
        assert!(pair[0].records_read <= pair[1].records_read);
    }
}

/// Persister that stalls long enough for readers to land mid-report.
struct SlowPersister(MemoryUsagePersister);

impl UsagePersister for SlowPersister {
    fn persist_usage(&self, job_id: &JobId, totals: &UsageTotals) -> Result<(), PersistError> {
        thread::sleep(Duration::from_millis(2));
        self.0.persist_usage(job_id, totals)
    }
}

#[test]
fn lifetime_totals_never_dip_during_a_report() {
    let usage = Arc::new(UsageReporter::new(
        JobId::new("usage-lifetime"),
        &config(1),
        Arc::new(SlowPersister(MemoryUsagePersister::default())),
        Arc::new(LoggingStatusObserver),
        Arc::new(SystemClock),
    ));
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let usage = Arc::clone(&usage);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for _ in 0..500 {
                usage.add_bytes_read(1);
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut last = 0;
    while !done.load(Ordering::SeqCst) {
        let seen = usage.lifetime_totals().bytes_read;
        assert!(seen >= last, "lifetime bytes went from {last} to {seen}");
        assert!(seen >= usage.persisted_totals().bytes_read);
        last = seen;
    }
    writer.join().unwrap();
    assert_eq!(usage.lifetime_totals().bytes_read, 500);
}

#[test]
fn failed_report_is_carried_and_flagged() {
    let persister = Arc::new(MemoryUsagePersister::default());
    let observer = Arc::new(RecordingObserver::default());
    let clock = Arc::new(ManualClock::new());
    let usage = UsageReporter::new(
        JobId::new("usage-fail"),
        &config(1_000),
        persister.clone(),
        observer.clone(),
        clock.clone(),
    );

    persister.set_failing(true);
    usage.add_bytes_read(10);
    clock.advance(Duration::from_secs(1));
    usage.add_bytes_read(5);

    assert!(persister.reports().is_empty());
    assert_eq!(observer.degraded_reasons().len(), 1);
    assert_eq!(usage.bytes_read_since_last_report(), 15);

    persister.set_failing(false);
    clock.advance(Duration::from_secs(1));
    assert!(usage.report_if_due().unwrap());
    assert_eq!(persister.last(), Some(UsageTotals::new(15, 0, 0)));
}

#[test]
fn final_report_is_unconditional() {
    let persister = Arc::new(MemoryUsagePersister::default());
    let usage = UsageReporter::new(
        JobId::new("usage-final"),
        &config(60_000),
        persister.clone(),
        Arc::new(LoggingStatusObserver),
        Arc::new(ManualClock::new()),
    );
    usage.add_fields_records_read(4);
    assert!(persister.reports().is_empty());

    assert_eq!(usage.finish().unwrap(), UsageTotals::new(0, 4, 1));
    assert_eq!(persister.reports().len(), 1);
}

#[test]
fn counting_reader_over_a_file_reports_every_byte() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    file.write_all(&payload).unwrap();
    file.flush().unwrap();

    let usage = Arc::new(UsageReporter::new(
        JobId::new("usage-file"),
        &config(60_000),
        Arc::new(MemoryUsagePersister::default()),
        Arc::new(LoggingStatusObserver),
        Arc::new(ManualClock::new()),
    ));
    let mut reader = CountingReader::new(file.reopen().unwrap(), Arc::clone(&usage));

    let mut out = Vec::new();
    let mut one = [0u8; 1];
    assert_eq!(reader.read(&mut one).unwrap(), 1);
    out.push(one[0]);
    let mut buf = [0u8; 777];
    loop {
        let n = reader.read(&mut buf[100..]).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[100..100 + n]);
    }

    assert_eq!(out, payload);
    assert_eq!(reader.bytes_read(), payload.len() as u64);
    assert_eq!(usage.bytes_read_since_last_report(), payload.len() as u64);
}
