//! Sparse offset/timestamp index for a segment.
//!
//! The index is a flat file of fixed-width 16-byte entries, one per record:
//!
//! ```text
//! +------------------+-----------+------------+
//! | relative_offset  | position  | timestamp  |
//! |      i32 BE      |  i32 BE   |   i64 BE   |
//! +------------------+-----------+------------+
//! ```
//!
//! `relative_offset` is the record offset minus the segment base offset, so
//! an index never outgrows i32 within one segment. On open the file is
//! memory-mapped read-only and mirrored into memory; lookups binary-search
//! the mirror, appends go through the file handle. A trailing partial entry
//! (torn write) is dropped on load.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use rill_core::Timestamp;

use crate::error::{LogError, LogResult};

/// Size of one index entry on disk.
pub const INDEX_ENTRY_SIZE: usize = 16;

/// A single index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Record offset relative to the segment base offset.
    pub relative_offset: i32,
    /// Byte position of the record frame in the data file.
    pub position: i32,
    /// Record timestamp in milliseconds.
    pub timestamp: i64,
}

impl IndexEntry {
    fn encode_into(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.relative_offset.to_be_bytes());
        buf.extend_from_slice(&self.position.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            relative_offset: i32::from_be_bytes(bytes[0..4].try_into().expect("4 bytes")),
            position: i32::from_be_bytes(bytes[4..8].try_into().expect("4 bytes")),
            timestamp: i64::from_be_bytes(bytes[8..16].try_into().expect("8 bytes")),
        }
    }
}

/// File-backed sparse index for one segment.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    writer: Mutex<File>,
    entries: RwLock<Vec<IndexEntry>>,
}

impl Index {
    /// Opens or creates the index file at the given path, loading any
    /// existing entries through a read-only memory map.
    pub fn open(path: impl Into<PathBuf>) -> LogResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| LogError::io("open index", e))?;

        let len = file
            .metadata()
            .map_err(|e| LogError::io("stat index", e))?
            .len() as usize;

        let mut entries = Vec::with_capacity(len / INDEX_ENTRY_SIZE);
        if len >= INDEX_ENTRY_SIZE {
            // SAFETY: the file is open for reading and the map is read-only;
            // it is dropped before this function returns.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| LogError::io("mmap index", e))?;
            let count = len / INDEX_ENTRY_SIZE;
            for i in 0..count {
                let start = i * INDEX_ENTRY_SIZE;
                entries.push(IndexEntry::decode(&mmap[start..start + INDEX_ENTRY_SIZE]));
            }
        }

        let index = Self {
            path,
            writer: Mutex::new(file),
            entries: RwLock::new(entries),
        };

        // Drop a torn trailing entry, if any.
        if len % INDEX_ENTRY_SIZE != 0 {
            let count = index.count();
            index.truncate_to_count(count)?;
        }

        Ok(index)
    }

    /// Returns the index file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns the first entry, if any.
    #[must_use]
    pub fn first(&self) -> Option<IndexEntry> {
        self.entries.read().first().copied()
    }

    /// Returns the last entry, if any.
    #[must_use]
    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.read().last().copied()
    }

    /// Appends entries to the index file and the in-memory mirror.
    pub fn append(&self, entries: &[IndexEntry]) -> LogResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(entries.len() * INDEX_ENTRY_SIZE);
        for entry in entries {
            entry.encode_into(&mut buf);
        }

        let mut file = self.writer.lock();
        file.write_all(&buf)
            .map_err(|e| LogError::io("append index", e))?;
        drop(file);

        self.entries.write().extend_from_slice(entries);
        Ok(())
    }

    /// Finds the greatest entry whose relative offset is `<= relative`.
    #[must_use]
    pub fn find_by_relative_offset(&self, relative: i32) -> Option<IndexEntry> {
        let entries = self.entries.read();
        let idx = entries.partition_point(|e| e.relative_offset <= relative);
        if idx == 0 {
            None
        } else {
            Some(entries[idx - 1])
        }
    }

    /// Finds the least entry whose timestamp is `>= timestamp`.
    #[must_use]
    pub fn find_by_timestamp(&self, timestamp: Timestamp) -> Option<IndexEntry> {
        let entries = self.entries.read();
        let idx = entries.partition_point(|e| e.timestamp < timestamp.as_millis());
        entries.get(idx).copied()
    }

    /// Drops all entries past the first `count`, shrinking the file to
    /// match.
    pub fn truncate_to_count(&self, count: usize) -> LogResult<()> {
        let mut entries = self.entries.write();
        entries.truncate(count);
        let file = self.writer.lock();
        file.set_len((count * INDEX_ENTRY_SIZE) as u64)
            .map_err(|e| LogError::io("truncate index", e))
    }

    /// Flushes buffered entries to the OS.
    pub fn flush(&self) -> LogResult<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| LogError::io("flush index", e))
    }

    /// Removes the index file.
    pub fn delete(&self) -> LogResult<()> {
        std::fs::remove_file(&self.path).map_err(|e| LogError::io("delete index", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(relative: i32, position: i32, timestamp: i64) -> IndexEntry {
        IndexEntry {
            relative_offset: relative,
            position,
            timestamp,
        }
    }

    #[test]
    fn test_append_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000000000000000000.index");

        let index = Index::open(&path).unwrap();
        index
            .append(&[entry(0, 0, 100), entry(1, 50, 200), entry(2, 110, 300)])
            .unwrap();
        index.flush().unwrap();
        drop(index);

        let reloaded = Index::open(&path).unwrap();
        assert_eq!(reloaded.count(), 3);
        assert_eq!(reloaded.first(), Some(entry(0, 0, 100)));
        assert_eq!(reloaded.last(), Some(entry(2, 110, 300)));
    }

    #[test]
    fn test_find_by_relative_offset() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path().join("x.index")).unwrap();
        index
            .append(&[entry(0, 0, 10), entry(2, 40, 20), entry(5, 90, 30)])
            .unwrap();

        assert_eq!(index.find_by_relative_offset(0), Some(entry(0, 0, 10)));
        assert_eq!(index.find_by_relative_offset(1), Some(entry(0, 0, 10)));
        assert_eq!(index.find_by_relative_offset(2), Some(entry(2, 40, 20)));
        assert_eq!(index.find_by_relative_offset(4), Some(entry(2, 40, 20)));
        assert_eq!(index.find_by_relative_offset(9), Some(entry(5, 90, 30)));
        assert_eq!(index.find_by_relative_offset(-1), None);
    }

    #[test]
    fn test_find_by_timestamp() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path().join("x.index")).unwrap();
        index
            .append(&[entry(0, 0, 10), entry(1, 40, 20), entry(2, 90, 30)])
            .unwrap();

        let at = |ms| Timestamp::from_millis(ms);
        assert_eq!(index.find_by_timestamp(at(5)), Some(entry(0, 0, 10)));
        assert_eq!(index.find_by_timestamp(at(10)), Some(entry(0, 0, 10)));
        assert_eq!(index.find_by_timestamp(at(15)), Some(entry(1, 40, 20)));
        assert_eq!(index.find_by_timestamp(at(30)), Some(entry(2, 90, 30)));
        assert_eq!(index.find_by_timestamp(at(31)), None);
    }

    #[test]
    fn test_torn_trailing_entry_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.index");

        let index = Index::open(&path).unwrap();
        index.append(&[entry(0, 0, 10), entry(1, 40, 20)]).unwrap();
        index.flush().unwrap();
        drop(index);

        // Simulate a torn write: append half an entry.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xab; 7]).unwrap();
        drop(file);

        let reloaded = Index::open(&path).unwrap();
        assert_eq!(reloaded.count(), 2);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (2 * INDEX_ENTRY_SIZE) as u64
        );
    }

    #[test]
    fn test_truncate_to_count() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path().join("t.index")).unwrap();
        index
            .append(&[entry(0, 0, 10), entry(1, 40, 20), entry(2, 90, 30)])
            .unwrap();

        index.truncate_to_count(1).unwrap();
        assert_eq!(index.count(), 1);
        assert_eq!(index.last(), Some(entry(0, 0, 10)));
    }
}
