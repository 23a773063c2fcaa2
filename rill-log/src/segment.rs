//! Log segments.
//!
//! A segment is a pair of append-only files covering a contiguous offset
//! range: `{base_offset:020}.log` holds framed message sets,
//! `{base_offset:020}.index` holds one 16-byte index entry per record.
//! Sealed segments are immutable except for delete; the active segment is
//! the unique last segment of a log.
//!
//! Truncation and compaction never modify a segment in place. They write a
//! sibling segment with a distinguishing filename suffix and atomically
//! rename it over the original ([`Segment::truncated`] /
//! [`Segment::replace`]).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rill_core::{entries_for_message_set, encode_message_set, FrameEntry, Offset, Record, Timestamp};
use tracing::warn;

use crate::error::{LogError, LogResult};
use crate::index::{Index, IndexEntry};

/// Suffix carried by a truncated sibling until it replaces the original.
pub(crate) const TRUNCATED_SUFFIX: &str = ".truncated";

/// Suffix carried by a compacted sibling until it replaces the original.
pub(crate) const COMPACTED_SUFFIX: &str = ".compacted";

/// A contiguous range of offsets persisted as one data file plus one index
/// file.
#[derive(Debug)]
pub struct Segment {
    dir: PathBuf,
    base_offset: i64,
    max_bytes: u64,
    suffix: &'static str,
    data_path: PathBuf,
    index: Index,
    /// Append handle. The lock also delimits the append critical section:
    /// offset assignment, encode, data write and index write all happen
    /// under it.
    writer: Mutex<File>,
    position: AtomicU64,
    next_offset: AtomicI64,
    /// Wall-clock time of the first write in millis, -1 if unwritten.
    first_write_time: AtomicI64,
    sealed: AtomicBool,
}

fn data_filename(base_offset: i64, suffix: &str) -> String {
    format!("{base_offset:020}{suffix}.log")
}

fn index_filename(base_offset: i64, suffix: &str) -> String {
    format!("{base_offset:020}{suffix}.index")
}

/// Parses a base offset out of a canonical `.log` filename. Returns `None`
/// for anything that is not exactly twenty digits plus the suffix.
pub(crate) fn parse_base_offset(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_suffix(".log")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

impl Segment {
    /// Creates a fresh segment with position 0 and `next_offset ==
    /// base_offset`. Any stale files at the target paths are truncated.
    pub fn create(
        dir: impl Into<PathBuf>,
        base_offset: Offset,
        max_bytes: u64,
        suffix: &'static str,
    ) -> LogResult<Self> {
        let dir = dir.into();
        let data_path = dir.join(data_filename(base_offset.get(), suffix));
        let index_path = dir.join(index_filename(base_offset.get(), suffix));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)
            .map_err(|e| LogError::io("create segment", e))?;

        // Reset a stale index left over from a crash before reopening it.
        if index_path.exists() {
            std::fs::remove_file(&index_path).map_err(|e| LogError::io("reset index", e))?;
        }
        let index = Index::open(&index_path)?;

        Ok(Self {
            dir,
            base_offset: base_offset.get(),
            max_bytes,
            suffix,
            data_path,
            index,
            writer: Mutex::new(file),
            position: AtomicU64::new(0),
            next_offset: AtomicI64::new(base_offset.get()),
            first_write_time: AtomicI64::new(-1),
            sealed: AtomicBool::new(false),
        })
    }

    /// Opens an existing segment, recovering `next_offset`, `position` and
    /// `first_write_time` from the index.
    ///
    /// Recovery reconciles the data file with the index: index entries whose
    /// frames are missing or torn are dropped, frames that were written but
    /// never indexed are re-indexed, and a torn data tail is truncated to
    /// the last complete frame.
    pub fn open(dir: impl Into<PathBuf>, base_offset: Offset, max_bytes: u64) -> LogResult<Self> {
        let dir = dir.into();
        let data_path = dir.join(data_filename(base_offset.get(), ""));
        let index_path = dir.join(index_filename(base_offset.get(), ""));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)
            .map_err(|e| LogError::io("open segment", e))?;
        let data_len = file
            .metadata()
            .map_err(|e| LogError::io("stat segment", e))?
            .len();

        let index = Index::open(&index_path)?;

        // Walk the index back to the last entry whose frame is complete.
        let mut count = index.count();
        let mut end = 0u64;
        while let Some(entry) = index.last() {
            match frame_end(&mut file, data_len, entry.position as u64) {
                Some(frame_end) => {
                    end = frame_end;
                    break;
                }
                None => {
                    count -= 1;
                    index.truncate_to_count(count)?;
                }
            }
        }

        if data_len > end {
            // Bytes past the last indexed frame: either writes that beat the
            // index to disk, or a torn tail.
            let mut tail = vec![0u8; (data_len - end) as usize];
            file.seek(SeekFrom::Start(end))
                .map_err(|e| LogError::io("seek segment", e))?;
            file.read_exact(&mut tail)
                .map_err(|e| LogError::io("read segment tail", e))?;

            match entries_for_message_set(end, &tail) {
                Ok(entries) => {
                    index.append(&to_index_entries(base_offset.get(), &entries))?;
                    end = data_len;
                }
                Err(_) => {
                    warn!(
                        segment = %data_path.display(),
                        tail_bytes = data_len - end,
                        "truncating torn segment tail"
                    );
                    file.set_len(end)
                        .map_err(|e| LogError::io("truncate segment tail", e))?;
                }
            }
        }

        file.seek(SeekFrom::End(0))
            .map_err(|e| LogError::io("seek segment", e))?;

        let next_offset = index
            .last()
            .map_or(base_offset.get(), |e| {
                base_offset.get() + i64::from(e.relative_offset) + 1
            });
        let first_write_time = index.first().map_or(-1, |e| e.timestamp);

        Ok(Self {
            dir,
            base_offset: base_offset.get(),
            max_bytes,
            suffix: "",
            data_path,
            index,
            writer: Mutex::new(file),
            position: AtomicU64::new(end),
            next_offset: AtomicI64::new(next_offset),
            first_write_time: AtomicI64::new(first_write_time),
            sealed: AtomicBool::new(false),
        })
    }

    /// Returns the first offset this segment may contain.
    #[must_use]
    pub const fn base_offset(&self) -> Offset {
        Offset::new(self.base_offset)
    }

    /// Returns the offset the next append will be assigned.
    #[must_use]
    pub fn next_offset(&self) -> Offset {
        Offset::new(self.next_offset.load(Ordering::Acquire))
    }

    /// Returns the offset of the last record, or `NONE` relative to an
    /// empty segment at base 0.
    #[must_use]
    pub fn newest_offset(&self) -> Offset {
        Offset::new(self.next_offset.load(Ordering::Acquire) - 1)
    }

    /// Returns the offset of the first record actually present, or `NONE`
    /// if the segment is empty. After compaction this may exceed the base
    /// offset.
    #[must_use]
    pub fn first_offset(&self) -> Offset {
        self.index.first().map_or(Offset::NONE, |e| {
            Offset::new(self.base_offset + i64::from(e.relative_offset))
        })
    }

    /// Returns the number of bytes written.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Returns the number of records in the segment.
    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.index.count() as u64
    }

    /// Returns the wall-clock time of the first write, if any.
    #[must_use]
    pub fn first_write_time(&self) -> Option<Timestamp> {
        let millis = self.first_write_time.load(Ordering::Acquire);
        (millis >= 0).then(|| Timestamp::from_millis(millis))
    }

    /// Returns the timestamp of the last record, if any.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.index.last().map(|e| Timestamp::from_millis(e.timestamp))
    }

    /// Returns true if the segment is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Returns true if the segment should be rolled before accepting
    /// `incoming` more bytes. An empty segment never rolls by size, so a
    /// single batch larger than the limit is still accepted.
    #[must_use]
    pub fn should_roll(&self, incoming: u64, max_age: Duration) -> bool {
        let position = self.position();
        if position > 0 && position + incoming > self.max_bytes {
            return true;
        }
        if max_age.is_zero() {
            return false;
        }
        self.first_write_time().is_some_and(|first| {
            let age = Timestamp::now().as_millis().saturating_sub(first.as_millis());
            age > i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX)
        })
    }

    /// Assigns offsets (and broker timestamps where the producer supplied
    /// none) to `records` and appends them as one message set.
    ///
    /// When `expected` is set the append fails with
    /// [`LogError::IncorrectOffset`] unless it equals the segment's next
    /// offset at the moment of the append.
    pub fn append(
        &self,
        records: &mut [Record],
        expected: Option<Offset>,
    ) -> LogResult<Vec<FrameEntry>> {
        let mut file = self.writer.lock();
        if self.is_sealed() {
            return Err(LogError::SegmentSealed);
        }

        let base_offset = self.next_offset.load(Ordering::Acquire);
        if let Some(expected) = expected {
            if expected.get() != base_offset {
                return Err(LogError::IncorrectOffset {
                    expected,
                    next: Offset::new(base_offset),
                });
            }
        }

        let now = Timestamp::now();
        #[allow(clippy::cast_possible_wrap)] // Batch sizes are far below i64::MAX.
        for (i, record) in records.iter_mut().enumerate() {
            record.offset = Offset::new(base_offset + i as i64);
            if record.timestamp.is_none() {
                record.timestamp = now;
            }
        }

        let ms = encode_message_set(records);
        let base_position = self.position.load(Ordering::Acquire);
        let entries = entries_for_message_set(base_position, &ms)?;
        self.write_framed(&mut file, &ms, &entries)?;
        Ok(entries)
    }

    /// Appends already-framed message-set bytes verbatim, as received from
    /// a leader. Offsets embedded in the frames are trusted.
    pub fn write_message_set(&self, ms: &[u8]) -> LogResult<Vec<FrameEntry>> {
        let mut file = self.writer.lock();
        if self.is_sealed() {
            return Err(LogError::SegmentSealed);
        }
        let base_position = self.position.load(Ordering::Acquire);
        let entries = entries_for_message_set(base_position, ms)?;
        self.write_framed(&mut file, ms, &entries)?;
        Ok(entries)
    }

    /// Writes framed bytes and index entries. Must hold the writer lock.
    fn write_framed(
        &self,
        file: &mut File,
        ms: &[u8],
        entries: &[FrameEntry],
    ) -> LogResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        file.write_all(ms)
            .map_err(|e| LogError::io("append segment", e))?;
        self.index
            .append(&to_index_entries(self.base_offset, entries))?;

        let last = entries.last().expect("entries is non-empty");
        self.position
            .fetch_add(ms.len() as u64, Ordering::AcqRel);
        self.next_offset
            .store(last.offset.get() + 1, Ordering::Release);
        let _ = self.first_write_time.compare_exchange(
            -1,
            Timestamp::now().as_millis(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    /// Finds the byte position of the greatest indexed record with
    /// `offset <= target`, or `None` if the target precedes every entry.
    #[must_use]
    pub fn find_position_for_offset(&self, target: Offset) -> Option<u64> {
        let relative = i32::try_from(target.get() - self.base_offset).ok()?;
        self.index
            .find_by_relative_offset(relative)
            .map(|e| e.position as u64)
    }

    /// Finds the least indexed record with `timestamp >= target`, returning
    /// its absolute offset and timestamp.
    #[must_use]
    pub fn find_entry_by_timestamp(&self, target: Timestamp) -> Option<(Offset, Timestamp)> {
        self.index.find_by_timestamp(target).map(|e| {
            (
                Offset::new(self.base_offset + i64::from(e.relative_offset)),
                Timestamp::from_millis(e.timestamp),
            )
        })
    }

    /// Reads decoded records with `offset >= start`, appending at most
    /// `max - collected.len()` of them to `collected`.
    pub fn read_records(
        &self,
        start: Offset,
        max: usize,
        collected: &mut Vec<Record>,
    ) -> LogResult<()> {
        let mut scanner = self.scan_from(self.find_position_for_offset(start).unwrap_or(0))?;
        while collected.len() < max {
            let Some((frame, entry)) = scanner.next_frame()? else {
                break;
            };
            if entry.offset < start {
                continue;
            }
            let mut bytes = frame;
            collected.push(Record::decode(&mut bytes)?);
        }
        Ok(())
    }

    /// Reads raw frames with `offset >= start` up to roughly `max_bytes`.
    /// Always returns at least one frame when one is available.
    pub fn read_raw_from(&self, start: Offset, max_bytes: usize) -> LogResult<Bytes> {
        let mut scanner = self.scan_from(self.find_position_for_offset(start).unwrap_or(0))?;
        let mut out = Vec::new();
        loop {
            let Some((frame, entry)) = scanner.next_frame()? else {
                break;
            };
            if entry.offset < start {
                continue;
            }
            if !out.is_empty() && out.len() + frame.len() > max_bytes {
                break;
            }
            out.extend_from_slice(&frame);
        }
        Ok(Bytes::from(out))
    }

    /// Returns a scanner over the whole segment from the start.
    pub fn scan(&self) -> LogResult<SegmentScanner> {
        self.scan_from(0)
    }

    fn scan_from(&self, position: u64) -> LogResult<SegmentScanner> {
        let mut file = File::open(&self.data_path).map_err(|e| LogError::io("open scan", e))?;
        file.seek(SeekFrom::Start(position))
            .map_err(|e| LogError::io("seek scan", e))?;
        Ok(SegmentScanner {
            reader: BufReader::new(file),
            position,
            end: self.position(),
        })
    }

    /// Seals the segment, disallowing further writes. Waits for any append
    /// in progress to finish.
    pub fn seal(&self) {
        let _guard = self.writer.lock();
        self.sealed.store(true, Ordering::Release);
    }

    /// Creates an empty sibling segment with the same base offset and a
    /// distinguishing suffix, for the copy-and-swap protocols.
    pub fn truncated(&self) -> LogResult<Self> {
        Self::create(
            self.dir.clone(),
            self.base_offset(),
            self.max_bytes,
            TRUNCATED_SUFFIX,
        )
    }

    /// Like [`Segment::truncated`] but for the compaction rewrite.
    pub fn compacted(&self) -> LogResult<Self> {
        Self::create(
            self.dir.clone(),
            self.base_offset(),
            self.max_bytes,
            COMPACTED_SUFFIX,
        )
    }

    /// Atomically renames this segment's files over `old` and reopens the
    /// result at the canonical paths.
    pub fn replace(self, old: &Self) -> LogResult<Self> {
        assert_eq!(self.base_offset, old.base_offset, "replace requires same base");
        self.sync()?;
        std::fs::rename(&self.data_path, &old.data_path)
            .map_err(|e| LogError::io("replace segment data", e))?;
        std::fs::rename(self.index.path(), old.index.path())
            .map_err(|e| LogError::io("replace segment index", e))?;
        Self::open(self.dir.clone(), self.base_offset(), self.max_bytes)
    }

    /// Flushes data and index to the OS and fsyncs the data file.
    pub fn sync(&self) -> LogResult<()> {
        let file = self.writer.lock();
        file.sync_all().map_err(|e| LogError::io("sync segment", e))?;
        drop(file);
        self.index.flush()
    }

    /// Removes the segment's files.
    pub fn delete(&self) -> LogResult<()> {
        std::fs::remove_file(&self.data_path).map_err(|e| LogError::io("delete segment", e))?;
        self.index.delete()
    }

    /// Returns the data file path.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

/// Returns the end position of the frame starting at `position`, or `None`
/// if the frame does not fit inside `data_len`.
fn frame_end(file: &mut File, data_len: u64, position: u64) -> Option<u64> {
    if position + 4 > data_len {
        return None;
    }
    file.seek(SeekFrom::Start(position)).ok()?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf).ok()?;
    let total_len = u64::from(u32::from_be_bytes(len_buf));
    let end = position + 4 + total_len;
    (end <= data_len).then_some(end)
}

#[allow(clippy::cast_possible_truncation)] // Positions bounded by max segment bytes.
fn to_index_entries(base_offset: i64, entries: &[FrameEntry]) -> Vec<IndexEntry> {
    entries
        .iter()
        .map(|e| IndexEntry {
            relative_offset: (e.offset.get() - base_offset) as i32,
            position: e.position as i32,
            timestamp: e.timestamp.as_millis(),
        })
        .collect()
}

/// Lazy, restartable scan over a segment's frames in order.
pub struct SegmentScanner {
    reader: BufReader<File>,
    position: u64,
    end: u64,
}

impl SegmentScanner {
    /// Returns the next frame and its entry, or `None` at the end of the
    /// snapshot taken when the scanner was created.
    pub fn next_frame(&mut self) -> LogResult<Option<(Bytes, FrameEntry)>> {
        if self.position >= self.end {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        self.reader
            .read_exact(&mut len_buf)
            .map_err(|e| LogError::io("scan frame length", e))?;
        let total_len = u32::from_be_bytes(len_buf) as usize;

        let mut frame = vec![0u8; 4 + total_len];
        frame[..4].copy_from_slice(&len_buf);
        self.reader
            .read_exact(&mut frame[4..])
            .map_err(|e| LogError::io("scan frame body", e))?;

        let entries = entries_for_message_set(self.position, &frame)?;
        let entry = entries.first().copied().ok_or(LogError::Corruption {
            message: "empty frame during scan".to_string(),
        })?;
        self.position += frame.len() as u64;
        Ok(Some((Bytes::from(frame), entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn records(values: &[&str]) -> Vec<Record> {
        values.iter().map(|v| Record::new((*v).to_string())).collect()
    }

    #[test]
    fn test_create_and_append() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
        assert_eq!(segment.next_offset(), Offset::new(0));
        assert_eq!(segment.newest_offset(), Offset::NONE);

        let mut batch = records(&["a", "b", "c"]);
        let entries = segment.append(&mut batch, None).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(batch[0].offset, Offset::new(0));
        assert_eq!(batch[2].offset, Offset::new(2));
        assert_eq!(segment.next_offset(), Offset::new(3));
        assert_eq!(segment.message_count(), 3);
    }

    #[test]
    fn test_append_expected_offset() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
        segment.append(&mut records(&["a"]), None).unwrap();

        let err = segment
            .append(&mut records(&["b"]), Some(Offset::new(0)))
            .unwrap_err();
        assert!(matches!(err, LogError::IncorrectOffset { .. }));

        segment
            .append(&mut records(&["b"]), Some(Offset::new(1)))
            .unwrap();
        assert_eq!(segment.next_offset(), Offset::new(2));
    }

    #[test]
    fn test_sealed_rejects_append() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
        segment.seal();
        let err = segment.append(&mut records(&["a"]), None).unwrap_err();
        assert!(matches!(err, LogError::SegmentSealed));
    }

    #[test]
    fn test_read_records() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), Offset::new(10), 1 << 20, "").unwrap();
        segment
            .append(&mut records(&["x", "y", "z", "w"]), None)
            .unwrap();

        let mut out = Vec::new();
        segment.read_records(Offset::new(11), 2, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].offset, Offset::new(11));
        assert_eq!(out[1].offset, Offset::new(12));
        assert_eq!(out[0].value.as_deref(), Some(&b"y"[..]));
    }

    #[test]
    fn test_reopen_recovers_state() {
        let dir = tempdir().unwrap();
        {
            let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
            segment.append(&mut records(&["a", "b"]), None).unwrap();
            segment.sync().unwrap();
        }

        let segment = Segment::open(dir.path(), Offset::new(0), 1 << 20).unwrap();
        assert_eq!(segment.next_offset(), Offset::new(2));
        assert_eq!(segment.message_count(), 2);
        assert!(segment.position() > 0);

        // Appends continue where the log left off.
        let mut batch = records(&["c"]);
        segment.append(&mut batch, None).unwrap();
        assert_eq!(batch[0].offset, Offset::new(2));
    }

    #[test]
    fn test_open_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let (good_position, data_path) = {
            let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
            segment.append(&mut records(&["a", "b"]), None).unwrap();
            segment.sync().unwrap();
            (segment.position(), segment.data_path().to_path_buf())
        };

        // Simulate a torn trailing write.
        let mut file = OpenOptions::new().append(true).open(&data_path).unwrap();
        file.write_all(&[0, 0, 0, 99, 1, 2, 3]).unwrap();
        drop(file);

        let segment = Segment::open(dir.path(), Offset::new(0), 1 << 20).unwrap();
        assert_eq!(segment.position(), good_position);
        assert_eq!(segment.next_offset(), Offset::new(2));
        assert_eq!(std::fs::metadata(&data_path).unwrap().len(), good_position);
    }

    #[test]
    fn test_open_reindexes_unindexed_frames() {
        let dir = tempdir().unwrap();
        let (data_path, index_path) = {
            let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
            segment.append(&mut records(&["a", "b", "c"]), None).unwrap();
            segment.sync().unwrap();
            (
                segment.data_path().to_path_buf(),
                segment.index.path().to_path_buf(),
            )
        };

        // Drop the last index entry; its frame stays in the data file.
        let index_len = std::fs::metadata(&index_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&index_path).unwrap();
        file.set_len(index_len - 16).unwrap();
        drop(file);

        let segment = Segment::open(dir.path(), Offset::new(0), 1 << 20).unwrap();
        assert_eq!(segment.message_count(), 3);
        assert_eq!(segment.next_offset(), Offset::new(3));
        assert_eq!(
            segment.position(),
            std::fs::metadata(&data_path).unwrap().len()
        );
    }

    #[test]
    fn test_truncated_replace() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), Offset::new(0), 1 << 20, "").unwrap();
        segment
            .append(&mut records(&["a", "b", "c", "d"]), None)
            .unwrap();

        // Copy frames below offset 2 into the sibling and swap.
        let sibling = segment.truncated().unwrap();
        let mut scanner = segment.scan().unwrap();
        while let Some((frame, entry)) = scanner.next_frame().unwrap() {
            if entry.offset >= Offset::new(2) {
                break;
            }
            sibling.write_message_set(&frame).unwrap();
        }
        let replaced = sibling.replace(&segment).unwrap();

        assert_eq!(replaced.next_offset(), Offset::new(2));
        let mut out = Vec::new();
        replaced.read_records(Offset::new(0), 10, &mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_should_roll_by_bytes() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), Offset::new(0), 64, "").unwrap();
        assert!(!segment.should_roll(10, Duration::ZERO));
        assert!(segment.should_roll(65, Duration::ZERO));

        segment.append(&mut records(&["0123456789"]), None).unwrap();
        assert!(segment.should_roll(32, Duration::ZERO));
    }

    #[test]
    fn test_parse_base_offset() {
        assert_eq!(parse_base_offset("00000000000000000042.log"), Some(42));
        assert_eq!(parse_base_offset("00000000000000000042.index"), None);
        assert_eq!(parse_base_offset("00000000000000000042.truncated.log"), None);
        assert_eq!(parse_base_offset("junk.log"), None);
    }
}
