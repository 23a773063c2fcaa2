//! Log cleaners.
//!
//! The delete cleaner enforces retention by age, total bytes and message
//! count. The compactor rewrites sealed, fully-committed segments keeping
//! only the latest record per key (tombstones evict, keyless records are
//! always retained) and regenerates the leader-epoch mapping from its
//! output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rill_core::{Offset, Record, Timestamp};
use tracing::{debug, info};

use crate::epoch::EpochEntry;
use crate::error::LogResult;
use crate::segment::Segment;

/// Retention limits enforced by the delete cleaner. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    /// Maximum total log bytes.
    pub bytes: u64,
    /// Maximum total message count.
    pub messages: u64,
    /// Maximum age of a segment's youngest record.
    pub age: Duration,
}

impl RetentionPolicy {
    fn is_disabled(self) -> bool {
        self.bytes == 0 && self.messages == 0 && self.age.is_zero()
    }
}

/// Deletes whole segments that fall outside the retention policy.
///
/// The active segment is never deleted and the log never drops below one
/// segment.
#[derive(Debug)]
pub(crate) struct DeleteCleaner {
    name: String,
    policy: RetentionPolicy,
}

impl DeleteCleaner {
    pub(crate) fn new(name: impl Into<String>, policy: RetentionPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    /// Applies retention to `segments`, deleting the files of dropped
    /// segments and returning the survivors.
    pub(crate) fn clean(&self, segments: Vec<Arc<Segment>>) -> LogResult<Vec<Arc<Segment>>> {
        if self.policy.is_disabled() || segments.len() <= 1 {
            return Ok(segments);
        }

        let mut keep_from = 0usize;
        let last = segments.len() - 1;

        if !self.policy.age.is_zero() {
            let cutoff = Timestamp::now().as_millis()
                - i64::try_from(self.policy.age.as_millis()).unwrap_or(i64::MAX);
            while keep_from < last
                && segments[keep_from]
                    .last_timestamp()
                    .is_some_and(|ts| ts.as_millis() < cutoff)
            {
                keep_from += 1;
            }
        }

        if self.policy.bytes > 0 {
            let mut total: u64 = segments[keep_from..].iter().map(|s| s.position()).sum();
            while keep_from < last && total > self.policy.bytes {
                total -= segments[keep_from].position();
                keep_from += 1;
            }
        }

        if self.policy.messages > 0 {
            let mut total: u64 = segments[keep_from..]
                .iter()
                .map(|s| s.message_count())
                .sum();
            while keep_from < last && total > self.policy.messages {
                total -= segments[keep_from].message_count();
                keep_from += 1;
            }
        }

        if keep_from == 0 {
            return Ok(segments);
        }

        info!(
            log = %self.name,
            dropped = keep_from,
            "delete cleaner removing segments below offset {}",
            segments[keep_from].base_offset()
        );
        for segment in &segments[..keep_from] {
            segment.delete()?;
        }
        Ok(segments[keep_from..].to_vec())
    }
}

/// Output of a compaction pass.
pub(crate) struct CompactionResult {
    /// The full segment list with compacted segments swapped in.
    pub segments: Vec<Arc<Segment>>,
    /// Leader-epoch boundaries observed in the compacted output, or `None`
    /// if no segment was eligible.
    pub epoch_entries: Option<Vec<EpochEntry>>,
    /// Exclusive end offset of the compacted range.
    pub compacted_end: Offset,
}

/// Key-based compactor.
#[derive(Debug)]
pub(crate) struct Compactor {
    name: String,
    max_threads: usize,
}

impl Compactor {
    pub(crate) fn new(name: impl Into<String>, max_threads: usize) -> Self {
        Self {
            name: name.into(),
            max_threads: max_threads.max(1),
        }
    }

    /// Compacts sealed segments whose records are all committed (at or
    /// below `hw`). Each eligible segment is rewritten into a sibling and
    /// atomically swapped in; the originals are deleted only after the
    /// swap.
    pub(crate) fn compact(
        &self,
        hw: Offset,
        segments: Vec<Arc<Segment>>,
    ) -> LogResult<CompactionResult> {
        // Eligible: sealed prefix fully below the HW. The active segment is
        // never sealed, so it is excluded by construction.
        let eligible = segments
            .iter()
            .take_while(|s| s.is_sealed() && !hw.is_none() && s.newest_offset() <= hw)
            .count();
        if eligible == 0 {
            return Ok(CompactionResult {
                segments,
                epoch_entries: None,
                compacted_end: Offset::NONE,
            });
        }

        let candidates = &segments[..eligible];
        let latest_by_key = self.build_key_map(candidates)?;
        debug!(
            log = %self.name,
            segments = eligible,
            keys = latest_by_key.len(),
            "compacting"
        );

        let mut compacted: Vec<Arc<Segment>> = Vec::with_capacity(segments.len());
        let mut epoch_entries: Vec<EpochEntry> = Vec::new();
        for segment in candidates {
            let rewritten = self.rewrite(segment, &latest_by_key, &mut epoch_entries)?;
            rewritten.seal();
            compacted.push(Arc::new(rewritten));
        }
        let compacted_end = candidates[eligible - 1].next_offset();
        compacted.extend_from_slice(&segments[eligible..]);

        Ok(CompactionResult {
            segments: compacted,
            epoch_entries: Some(epoch_entries),
            compacted_end,
        })
    }

    /// First pass: map each key to the offset of its latest record,
    /// tombstones included. Segments are scanned by a bounded worker pool.
    fn build_key_map(&self, segments: &[Arc<Segment>]) -> LogResult<HashMap<Bytes, i64>> {
        let chunk = segments.len().div_ceil(self.max_threads);
        let mut merged: HashMap<Bytes, i64> = HashMap::new();

        let partials: Vec<LogResult<HashMap<Bytes, i64>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = segments
                .chunks(chunk)
                .map(|chunk| scope.spawn(move || scan_keys(chunk)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("compaction scan thread panicked"))
                .collect()
        });

        for partial in partials {
            for (key, offset) in partial? {
                merged
                    .entry(key)
                    .and_modify(|o| *o = (*o).max(offset))
                    .or_insert(offset);
            }
        }
        Ok(merged)
    }

    /// Second pass: rewrite one segment keeping only surviving records,
    /// preserving order, and record epoch boundaries seen in the output.
    fn rewrite(
        &self,
        segment: &Segment,
        latest_by_key: &HashMap<Bytes, i64>,
        epoch_entries: &mut Vec<EpochEntry>,
    ) -> LogResult<Segment> {
        let sibling = segment.compacted()?;
        let mut scanner = segment.scan()?;
        while let Some((frame, entry)) = scanner.next_frame()? {
            let mut bytes = frame.clone();
            let record = Record::decode(&mut bytes)?;
            let keep = match &record.key {
                None => true,
                Some(key) => latest_by_key.get(key) == Some(&entry.offset.get()),
            };
            if !keep {
                continue;
            }
            sibling.write_message_set(&frame)?;
            if epoch_entries
                .last()
                .map_or(entry.leader_epoch.get() > 0, |last| {
                    entry.leader_epoch > last.epoch
                })
            {
                epoch_entries.push(EpochEntry {
                    epoch: entry.leader_epoch,
                    start_offset: entry.offset,
                });
            }
        }
        sibling.replace(segment)
    }
}

fn scan_keys(segments: &[Arc<Segment>]) -> LogResult<HashMap<Bytes, i64>> {
    let mut map = HashMap::new();
    for segment in segments {
        let mut scanner = segment.scan()?;
        while let Some((frame, entry)) = scanner.next_frame()? {
            let mut bytes = frame;
            let record = Record::decode(&mut bytes)?;
            if let Some(key) = record.key {
                map.entry(key)
                    .and_modify(|o: &mut i64| *o = (*o).max(entry.offset.get()))
                    .or_insert(entry.offset.get());
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::LeaderEpoch;
    use tempfile::tempdir;

    fn segment_with(dir: &std::path::Path, base: i64, records: &mut [Record]) -> Arc<Segment> {
        let segment = Segment::create(dir, Offset::new(base), 1 << 20, "").unwrap();
        segment.append(records, None).unwrap();
        Arc::new(segment)
    }

    fn keyed(key: &str, value: &str) -> Record {
        Record::with_key(key.to_string(), value.to_string())
    }

    #[test]
    fn test_retention_by_messages() {
        let dir = tempdir().unwrap();
        let s1 = segment_with(dir.path(), 0, &mut [keyed("a", "1"), keyed("b", "2")]);
        s1.seal();
        let s2 = segment_with(dir.path() /* same dir, different base */, 2, &mut [keyed("c", "3")]);

        let cleaner = DeleteCleaner::new(
            "test",
            RetentionPolicy {
                messages: 1,
                ..RetentionPolicy::default()
            },
        );
        let cleaned = cleaner.clean(vec![s1, s2]).unwrap();
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].base_offset(), Offset::new(2));
    }

    #[test]
    fn test_retention_never_drops_active() {
        let dir = tempdir().unwrap();
        let only = segment_with(dir.path(), 0, &mut [keyed("a", "1"), keyed("b", "2")]);

        let cleaner = DeleteCleaner::new(
            "test",
            RetentionPolicy {
                messages: 1,
                bytes: 1,
                ..RetentionPolicy::default()
            },
        );
        let cleaned = cleaner.clean(vec![only]).unwrap();
        assert_eq!(cleaned.len(), 1);
    }

    #[test]
    fn test_compaction_keeps_latest_per_key() {
        let dir = tempdir().unwrap();
        let segment = segment_with(
            dir.path(),
            0,
            &mut [
                keyed("k1", "old"),
                keyed("k2", "first"),
                keyed("k1", "new"),
                Record::new("keyless"),
            ],
        );
        segment.seal();

        let compactor = Compactor::new("test", 2);
        let result = compactor
            .compact(Offset::new(3), vec![segment])
            .unwrap();

        let mut out = Vec::new();
        result.segments[0]
            .read_records(Offset::new(0), 10, &mut out)
            .unwrap();
        let values: Vec<_> = out
            .iter()
            .map(|r| String::from_utf8_lossy(r.value.as_deref().unwrap()).to_string())
            .collect();
        // "old" is dropped; order of survivors is preserved.
        assert_eq!(values, vec!["first", "new", "keyless"]);
        assert_eq!(out[1].offset, Offset::new(2));
    }

    #[test]
    fn test_compaction_tombstone_evicts_key() {
        let dir = tempdir().unwrap();
        let segment = segment_with(
            dir.path(),
            0,
            &mut [keyed("k", "v1"), keyed("k", "v2"), Record::tombstone("k")],
        );
        segment.seal();

        let compactor = Compactor::new("test", 1);
        let result = compactor
            .compact(Offset::new(2), vec![segment])
            .unwrap();

        let mut out = Vec::new();
        result.segments[0]
            .read_records(Offset::new(0), 10, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_tombstone());
        assert_eq!(out[0].offset, Offset::new(2));
    }

    #[test]
    fn test_compaction_skips_uncommitted_segments() {
        let dir = tempdir().unwrap();
        let s1 = segment_with(dir.path(), 0, &mut [keyed("k", "v1")]);
        s1.seal();
        let s2 = segment_with(dir.path(), 1, &mut [keyed("k", "v2")]);
        s2.seal();

        // HW covers only the first segment; the second must be untouched.
        let compactor = Compactor::new("test", 1);
        let result = compactor
            .compact(Offset::new(0), vec![s1, s2])
            .unwrap();

        assert_eq!(result.compacted_end, Offset::new(1));
        let mut out = Vec::new();
        result.segments[1]
            .read_records(Offset::new(1), 10, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_compaction_regenerates_epochs() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
        let mut records = vec![keyed("k", "old"), keyed("k", "mid"), keyed("k", "new")];
        records[0].leader_epoch = LeaderEpoch::new(1);
        records[1].leader_epoch = LeaderEpoch::new(1);
        records[2].leader_epoch = LeaderEpoch::new(2);
        segment.append(&mut records, None).unwrap();
        segment.seal();

        let compactor = Compactor::new("test", 1);
        let result = compactor
            .compact(Offset::new(2), vec![Arc::new(segment)])
            .unwrap();

        // Only the epoch-2 record survives; the regenerated mapping starts
        // at its offset.
        assert_eq!(
            result.epoch_entries.unwrap(),
            vec![EpochEntry {
                epoch: LeaderEpoch::new(2),
                start_offset: Offset::new(2),
            }]
        );
    }
}
