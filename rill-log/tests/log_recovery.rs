//! End-to-end commit log tests: dense appends, segment rolling, recovery
//! and the timestamp index.

use rill_core::{Offset, Record, Timestamp};
use rill_log::{CommitLog, LogConfig};
use std::time::Duration;
use tempfile::tempdir;

fn quiet_config() -> LogConfig {
    // Background loops are irrelevant to these tests; push them out.
    LogConfig::new()
        .with_hw_checkpoint_interval(Duration::from_secs(3600))
        .with_cleaner_interval(Duration::from_secs(3600))
}

fn value_of(record: &Record) -> String {
    String::from_utf8_lossy(record.value.as_deref().unwrap()).to_string()
}

#[tokio::test]
async fn dense_offset_append() {
    let dir = tempdir().unwrap();
    let log = CommitLog::open(dir.path().join("p0"), quiet_config()).unwrap();

    for i in 0..100 {
        let offsets = log
            .append(vec![Record::with_key("k", i.to_string())])
            .unwrap();
        assert_eq!(offsets, vec![Offset::new(i)]);
    }
    assert_eq!(log.newest_offset(), Offset::new(99));

    let records = log.read(Offset::new(0), 1000).unwrap();
    assert_eq!(records.len(), 100);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.offset, Offset::new(i as i64));
        assert_eq!(value_of(record), i.to_string());
    }
    log.close().await.unwrap();
}

#[tokio::test]
async fn segment_roll_by_bytes() {
    let dir = tempdir().unwrap();
    let config = quiet_config().with_max_segment_bytes(1024);
    let log = CommitLog::open(dir.path().join("p0"), config).unwrap();

    let mut appended = 0i64;
    while std::fs::read_dir(dir.path().join("p0"))
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".log")
        })
        .count()
        < 2
    {
        log.append(vec![Record::new(format!("value-{appended}"))])
            .unwrap();
        appended += 1;
        assert!(appended < 10_000, "log never rolled");
    }

    // First segment starts at 0, second where the first ended; scanning
    // across both yields the full monotone sequence.
    let records = log.read(Offset::new(0), 10_000).unwrap();
    assert_eq!(records.len() as i64, appended);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.offset, Offset::new(i as i64));
        assert_eq!(value_of(record), format!("value-{i}"));
    }
    log.close().await.unwrap();
}

#[tokio::test]
async fn reopen_returns_identical_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p0");
    let config = quiet_config().with_max_segment_bytes(512);

    let originals: Vec<Record> = (0..40)
        .map(|i| {
            Record::with_key(format!("key-{}", i % 7), format!("value-{i}"))
                .with_timestamp(Timestamp::from_millis(1_000 + i))
                .with_header("seq", i.to_string())
        })
        .collect();

    {
        let log = CommitLog::open(&path, config.clone()).unwrap();
        log.append(originals.clone()).unwrap();
        log.close().await.unwrap();
    }

    let log = CommitLog::open(&path, config).unwrap();
    let records = log.read(Offset::new(0), 100).unwrap();
    assert_eq!(records.len(), originals.len());
    for (i, (read, original)) in records.iter().zip(&originals).enumerate() {
        assert_eq!(read.offset, Offset::new(i as i64));
        assert_eq!(read.key, original.key);
        assert_eq!(read.value, original.value);
        assert_eq!(read.timestamp, original.timestamp);
        assert_eq!(read.headers, original.headers);
    }
    log.close().await.unwrap();
}

#[tokio::test]
async fn timestamp_index_boundaries() {
    let dir = tempdir().unwrap();
    let log = CommitLog::open(dir.path().join("p0"), quiet_config()).unwrap();

    for ts in [10, 20, 30, 40, 50] {
        log.append(vec![
            Record::new(format!("t{ts}")).with_timestamp(Timestamp::from_millis(ts)),
        ])
        .unwrap();
    }

    assert_eq!(
        log.earliest_offset_after_timestamp(Timestamp::from_millis(25))
            .unwrap(),
        Offset::new(2)
    );
    assert_eq!(
        log.latest_offset_before_timestamp(Timestamp::from_millis(25))
            .unwrap(),
        Offset::new(1)
    );
    // Beyond the log end: the next assignable offset.
    assert_eq!(
        log.earliest_offset_after_timestamp(Timestamp::from_millis(100))
            .unwrap(),
        Offset::new(5)
    );
    log.close().await.unwrap();
}

#[tokio::test]
async fn truncation_drops_all_records_at_and_past_offset() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p0");
    let config = quiet_config().with_max_segment_bytes(256);
    let log = CommitLog::open(&path, config.clone()).unwrap();

    for i in 0..30 {
        log.append(vec![Record::new(format!("v{i}"))]).unwrap();
    }
    log.truncate(Offset::new(11)).unwrap();
    assert_eq!(log.newest_offset(), Offset::new(10));

    let records = log.read(Offset::new(0), 100).unwrap();
    assert_eq!(records.len(), 11);
    assert!(records.iter().all(|r| r.offset < Offset::new(11)));
    log.close().await.unwrap();

    // Nothing at or past the truncation point survives reopen either.
    let log = CommitLog::open(&path, config).unwrap();
    assert_eq!(log.newest_offset(), Offset::new(10));
    let records = log.read(Offset::new(0), 100).unwrap();
    assert_eq!(records.len(), 11);
    log.close().await.unwrap();
}
