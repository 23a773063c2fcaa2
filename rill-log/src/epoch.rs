//! Leader-epoch cache.
//!
//! An ordered mapping from leader epoch to the first offset assigned in
//! that epoch, durably checkpointed as a text file. During follower
//! truncation the follower asks the leader "where does my current epoch
//! end?" and truncates to the answer, so no divergent prefix survives a
//! fast leader change.
//!
//! Checkpoint format: one line per entry, `"{epoch} {start_offset}\n"`,
//! strictly increasing in both fields. Persistence uses the
//! write-temp-then-rename pattern so a crash never leaves a half-written
//! checkpoint.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rill_core::{LeaderEpoch, Offset};
use tracing::debug;

use crate::error::{LogError, LogResult};

/// Checkpoint filename inside a partition directory.
pub const EPOCH_FILE_NAME: &str = "leader-epochs";

/// One epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochEntry {
    /// The leader epoch.
    pub epoch: LeaderEpoch,
    /// First offset assigned in this epoch.
    pub start_offset: Offset,
}

/// Durable, ordered epoch → start-offset mapping for one partition.
#[derive(Debug)]
pub struct EpochCache {
    path: PathBuf,
    entries: RwLock<Vec<EpochEntry>>,
}

impl EpochCache {
    /// Opens the cache in the given partition directory, loading the
    /// checkpoint if present.
    pub fn open(dir: &Path) -> LogResult<Self> {
        let path = dir.join(EPOCH_FILE_NAME);
        let mut entries = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let mut parts = line.split_whitespace();
                    let (Some(epoch), Some(offset)) = (parts.next(), parts.next()) else {
                        return Err(LogError::Corruption {
                            message: format!("malformed epoch checkpoint line: {line:?}"),
                        });
                    };
                    let epoch: u64 = epoch.parse().map_err(|_| LogError::Corruption {
                        message: format!("bad epoch in checkpoint: {line:?}"),
                    })?;
                    let offset: i64 = offset.parse().map_err(|_| LogError::Corruption {
                        message: format!("bad offset in checkpoint: {line:?}"),
                    })?;
                    entries.push(EpochEntry {
                        epoch: LeaderEpoch::new(epoch),
                        start_offset: Offset::new(offset),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LogError::io("read epoch checkpoint", e)),
        }
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Records that `epoch` starts at `offset`.
    ///
    /// The epoch must be strictly greater than the last assigned epoch.
    /// Entries whose start offset is at or past `offset` are dropped first,
    /// which makes back-to-back leader changes with no intervening writes
    /// collapse onto the latest epoch.
    pub fn assign(&self, epoch: LeaderEpoch, offset: Offset) -> LogResult<()> {
        let mut entries = self.entries.write();
        while entries
            .last()
            .is_some_and(|last| last.start_offset >= offset)
        {
            entries.pop();
        }
        if let Some(last) = entries.last() {
            if epoch <= last.epoch {
                return Err(LogError::EpochMonotonicity {
                    epoch: epoch.get(),
                    last: last.epoch.get(),
                });
            }
        }
        debug!(epoch = epoch.get(), offset = offset.get(), "assigning leader epoch");
        entries.push(EpochEntry {
            epoch,
            start_offset: offset,
        });
        self.persist(&entries)
    }

    /// Returns the latest assigned epoch, or epoch 0 if the cache is empty.
    #[must_use]
    pub fn last_leader_epoch(&self) -> LeaderEpoch {
        self.entries
            .read()
            .last()
            .map_or(LeaderEpoch::new(0), |e| e.epoch)
    }

    /// Returns the exclusive end offset of `requested`: the start offset of
    /// the least epoch strictly greater than it. Returns `NONE` when the
    /// requested epoch is the latest (or beyond), signalling "use the log
    /// end offset".
    #[must_use]
    pub fn last_offset_for_leader_epoch(&self, requested: LeaderEpoch) -> Offset {
        let entries = self.entries.read();
        let idx = entries.partition_point(|e| e.epoch <= requested);
        entries.get(idx).map_or(Offset::NONE, |e| e.start_offset)
    }

    /// Drops entries whose start offset is at or past `end_offset`. Used
    /// after an unclean restart (with the log end offset) and after
    /// truncation (with the truncation point).
    pub fn clear_latest(&self, end_offset: Offset) -> LogResult<()> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.start_offset < end_offset);
        if entries.len() == before {
            return Ok(());
        }
        self.persist(&entries)
    }

    /// Drops entries that start before `oldest`, keeping the last such
    /// entry rewritten with `start_offset = oldest` so the epoch of the
    /// earliest surviving records is preserved.
    pub fn clear_earliest(&self, oldest: Offset) -> LogResult<()> {
        if oldest.is_none() {
            return Ok(());
        }
        let mut entries = self.entries.write();
        let stale = entries.partition_point(|e| e.start_offset < oldest);
        if stale == 0 {
            return Ok(());
        }
        let floor = entries[stale - 1];
        entries.drain(..stale);
        if entries.first().map_or(true, |e| e.start_offset > oldest) {
            entries.insert(
                0,
                EpochEntry {
                    epoch: floor.epoch,
                    start_offset: oldest,
                },
            );
        }
        self.persist(&entries)
    }

    /// Replaces the cache contents, used when compaction regenerates the
    /// mapping from its output.
    pub fn replace(&self, new_entries: Vec<EpochEntry>) -> LogResult<()> {
        let mut entries = self.entries.write();
        *entries = new_entries;
        self.persist(&entries)
    }

    /// Returns the entries with start offset at or past `from`. Used to
    /// rebase epochs observed in segments appended while a compaction pass
    /// was running.
    #[must_use]
    pub fn entries_from(&self, from: Offset) -> Vec<EpochEntry> {
        self.entries
            .read()
            .iter()
            .copied()
            .filter(|e| e.start_offset >= from)
            .collect()
    }

    /// Returns a snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<EpochEntry> {
        self.entries.read().clone()
    }

    fn persist(&self, entries: &[EpochEntry]) -> LogResult<()> {
        let mut contents = String::new();
        for entry in entries {
            contents.push_str(&format!(
                "{} {}\n",
                entry.epoch.get(),
                entry.start_offset.get()
            ));
        }
        atomic_write(&self.path, contents.as_bytes())
            .map_err(|e| LogError::io("persist epoch checkpoint", e))
    }
}

/// Writes `contents` to `path` atomically via a temp file and rename.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn epoch(e: u64) -> LeaderEpoch {
        LeaderEpoch::new(e)
    }

    #[test]
    fn test_assign_and_reload() {
        let dir = tempdir().unwrap();
        let cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(epoch(1), Offset::new(0)).unwrap();
        cache.assign(epoch(3), Offset::new(50)).unwrap();
        drop(cache);

        let reloaded = EpochCache::open(dir.path()).unwrap();
        assert_eq!(reloaded.last_leader_epoch(), epoch(3));
        assert_eq!(
            reloaded.entries(),
            vec![
                EpochEntry { epoch: epoch(1), start_offset: Offset::new(0) },
                EpochEntry { epoch: epoch(3), start_offset: Offset::new(50) },
            ]
        );
    }

    #[test]
    fn test_assign_rejects_stale_epoch() {
        let dir = tempdir().unwrap();
        let cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(epoch(2), Offset::new(0)).unwrap();
        let err = cache.assign(epoch(2), Offset::new(10)).unwrap_err();
        assert!(matches!(err, LogError::EpochMonotonicity { .. }));
    }

    #[test]
    fn test_assign_collapses_unwritten_epochs() {
        let dir = tempdir().unwrap();
        let cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(epoch(1), Offset::new(5)).unwrap();
        // Leader changed again before any write landed in epoch 1.
        cache.assign(epoch(2), Offset::new(5)).unwrap();

        assert_eq!(cache.last_leader_epoch(), epoch(2));
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn test_last_offset_for_leader_epoch() {
        let dir = tempdir().unwrap();
        let cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(epoch(1), Offset::new(0)).unwrap();
        cache.assign(epoch(2), Offset::new(10)).unwrap();
        cache.assign(epoch(4), Offset::new(25)).unwrap();

        // End of epoch 1 is where epoch 2 starts.
        assert_eq!(cache.last_offset_for_leader_epoch(epoch(1)), Offset::new(10));
        // Epoch 3 was never assigned: next greater is 4.
        assert_eq!(cache.last_offset_for_leader_epoch(epoch(3)), Offset::new(25));
        // Latest epoch: caller should use the log end offset.
        assert_eq!(cache.last_offset_for_leader_epoch(epoch(4)), Offset::NONE);
        assert_eq!(cache.last_offset_for_leader_epoch(epoch(9)), Offset::NONE);
    }

    #[test]
    fn test_clear_latest() {
        let dir = tempdir().unwrap();
        let cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(epoch(1), Offset::new(0)).unwrap();
        cache.assign(epoch(2), Offset::new(10)).unwrap();
        cache.assign(epoch(3), Offset::new(20)).unwrap();

        cache.clear_latest(Offset::new(10)).unwrap();
        assert_eq!(cache.last_leader_epoch(), epoch(1));
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn test_clear_earliest_keeps_floor_entry() {
        let dir = tempdir().unwrap();
        let cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(epoch(1), Offset::new(0)).unwrap();
        cache.assign(epoch(2), Offset::new(10)).unwrap();
        cache.assign(epoch(3), Offset::new(20)).unwrap();

        cache.clear_earliest(Offset::new(15)).unwrap();
        assert_eq!(
            cache.entries(),
            vec![
                EpochEntry { epoch: epoch(2), start_offset: Offset::new(15) },
                EpochEntry { epoch: epoch(3), start_offset: Offset::new(20) },
            ]
        );
    }

    #[test]
    fn test_clear_earliest_exact_boundary() {
        let dir = tempdir().unwrap();
        let cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(epoch(1), Offset::new(0)).unwrap();
        cache.assign(epoch(2), Offset::new(10)).unwrap();

        cache.clear_earliest(Offset::new(10)).unwrap();
        assert_eq!(
            cache.entries(),
            vec![EpochEntry { epoch: epoch(2), start_offset: Offset::new(10) }]
        );
    }
}
