//! The per-partition durable commit log.
//!
//! A commit log owns an ordered sequence of [`Segment`]s for one partition,
//! enforces rolling and retention, maintains the high watermark (HW) and
//! its waiters, and checkpoints the HW to disk in the background.
//!
//! # Concurrency
//!
//! The segment list sits behind a read-write lock taken only for list
//! mutation (roll, truncate, clean). The hot-path append goes through the
//! active segment's own append mutex; the active-segment pointer is a
//! shared cell swapped by compare-and-swap during rolls, so readers observe
//! a consistent segment without the list lock. Losers of the roll race see
//! [`LogError::SegmentExists`] and retry against the new active segment.
//!
//! # Committed reads
//!
//! No record is considered committed until the HW covers it. Readers park
//! on [`CommitLog::wait_for_hw`]; registration and HW publication are
//! serialized under the HW mutex so no wakeup is lost.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rill_core::{FrameEntry, LeaderEpoch, Offset, Record, Timestamp, WaiterId};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cleaner::{CompactionResult, Compactor, DeleteCleaner, RetentionPolicy};
use crate::config::LogConfig;
use crate::epoch::{atomic_write, EpochCache};
use crate::error::{LogError, LogResult};
use crate::segment::{parse_base_offset, Segment, COMPACTED_SUFFIX, TRUNCATED_SUFFIX};

/// High watermark checkpoint filename inside a partition directory.
pub const HW_CHECKPOINT_FILE_NAME: &str = "replication-offset-checkpoint";

struct HwState {
    hw: i64,
    waiters: HashMap<WaiterId, oneshot::Sender<bool>>,
}

/// A durable, segmented write-ahead log for one partition.
pub struct CommitLog {
    name: String,
    dir: PathBuf,
    config: LogConfig,
    /// Ordered segment list. Write lock only for list mutation.
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Active-segment pointer cell. Swapped via compare-and-swap on roll.
    active: RwLock<Arc<Segment>>,
    /// HW plus its waiters. Wakeups are published under this lock.
    hw: Mutex<HwState>,
    /// Waiters parked until the log end offset advances.
    leo_waiters: Mutex<HashMap<WaiterId, oneshot::Sender<()>>>,
    epoch_cache: EpochCache,
    readonly: AtomicBool,
    deleted: AtomicBool,
    delete_cleaner: DeleteCleaner,
    compactor: Compactor,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommitLog {
    /// Opens (or creates) the log in `dir`, recovering segments, the high
    /// watermark and the leader-epoch cache, and starts the background
    /// checkpoint and cleaner tasks.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> LogResult<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| LogError::io("create log dir", e))?;
        let name = dir
            .file_name()
            .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned());

        let (segments, hw) = Self::recover_dir(&dir, &config)?;
        let active = segments.last().cloned().ok_or(LogError::Corruption {
            message: "recovery produced no segments".to_string(),
        })?;

        let epoch_cache = EpochCache::open(&dir)?;
        // After an unclean shutdown the epoch checkpoint can be ahead of the
        // log (the log flushes asynchronously), and the earliest entry may
        // not reflect retention. Reconcile both directions.
        epoch_cache.clear_latest(active.next_offset())?;
        let oldest = segments
            .iter()
            .map(|s| s.first_offset())
            .find(|o| !o.is_none())
            .unwrap_or(Offset::NONE);
        epoch_cache.clear_earliest(oldest)?;

        let retention = RetentionPolicy {
            bytes: config.max_log_bytes,
            messages: config.max_log_messages,
            age: config.max_log_age,
        };
        let (closed, _) = watch::channel(false);

        let log = Arc::new(Self {
            delete_cleaner: DeleteCleaner::new(name.clone(), retention),
            compactor: Compactor::new(name.clone(), config.compact_max_threads),
            name,
            dir,
            segments: RwLock::new(segments),
            active: RwLock::new(active),
            hw: Mutex::new(HwState {
                hw,
                waiters: HashMap::new(),
            }),
            leo_waiters: Mutex::new(HashMap::new()),
            epoch_cache,
            readonly: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            config,
            closed,
            tasks: Mutex::new(Vec::new()),
        });
        log.spawn_background_tasks();
        Ok(log)
    }

    /// Scans the directory, deleting index orphans and leftovers from
    /// interrupted copy-and-swap protocols, and opens the segments in
    /// base-offset order.
    fn recover_dir(dir: &Path, config: &LogConfig) -> LogResult<(Vec<Arc<Segment>>, i64)> {
        let mut bases = Vec::new();
        let mut hw = -1i64;

        let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("read log dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("read log dir entry", e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();

            if file_name.contains(TRUNCATED_SUFFIX)
                || file_name.contains(COMPACTED_SUFFIX)
                || file_name.ends_with(".tmp")
            {
                warn!(file = %file_name, "removing interrupted swap leftover");
                std::fs::remove_file(entry.path())
                    .map_err(|e| LogError::io("remove swap leftover", e))?;
            } else if let Some(base) = parse_base_offset(&file_name) {
                bases.push(base);
            } else if file_name.ends_with(".index") {
                // An index without a data file is an orphan.
                let data = entry.path().with_extension("log");
                if !data.exists() {
                    warn!(file = %file_name, "removing orphaned index");
                    std::fs::remove_file(entry.path())
                        .map_err(|e| LogError::io("remove orphaned index", e))?;
                }
            } else if file_name == HW_CHECKPOINT_FILE_NAME {
                let contents = std::fs::read_to_string(entry.path())
                    .map_err(|e| LogError::io("read hw checkpoint", e))?;
                hw = contents
                    .trim()
                    .parse()
                    .map_err(|_| LogError::Corruption {
                        message: format!("bad hw checkpoint: {contents:?}"),
                    })?;
            }
        }

        bases.sort_unstable();
        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in bases {
            segments.push(Arc::new(Segment::open(
                dir,
                Offset::new(base),
                config.max_segment_bytes,
            )?));
        }
        if segments.is_empty() {
            segments.push(Arc::new(Segment::create(
                dir,
                Offset::new(0),
                config.max_segment_bytes,
                "",
            )?));
        } else {
            // All but the last were sealed when they were rolled.
            for segment in &segments[..segments.len() - 1] {
                segment.seal();
            }
        }
        Ok((segments, hw))
    }

    /// Returns the log name (the partition directory name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn active(&self) -> Arc<Segment> {
        self.active.read().clone()
    }

    /// Returns the offset of the last record, or `NONE` if the log is
    /// empty.
    #[must_use]
    pub fn newest_offset(&self) -> Offset {
        self.active().newest_offset()
    }

    /// Returns the log end offset: the offset the next append will be
    /// assigned.
    #[must_use]
    pub fn log_end_offset(&self) -> Offset {
        self.active().next_offset()
    }

    /// Returns the offset of the first record, or `NONE` if the log is
    /// empty.
    #[must_use]
    pub fn oldest_offset(&self) -> Offset {
        self.segments
            .read()
            .iter()
            .map(|s| s.first_offset())
            .find(|o| !o.is_none())
            .unwrap_or(Offset::NONE)
    }

    /// Appends a batch of records, assigning contiguous offsets starting at
    /// the active segment's next offset. Returns the assigned offsets.
    ///
    /// Fails with [`LogError::Readonly`] when the log is readonly. With
    /// optimistic concurrency control enabled, the caller-supplied offset
    /// of the first record must equal the next offset or the append fails
    /// with [`LogError::IncorrectOffset`].
    pub fn append(&self, mut records: Vec<Record>) -> LogResult<Vec<Offset>> {
        if self.is_readonly() {
            return Err(LogError::Readonly);
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let expected = self
            .config
            .concurrency_control
            .then(|| records[0].offset);

        let incoming: u64 = records.iter().map(|r| r.frame_size() as u64).sum();
        loop {
            self.check_and_perform_split(incoming)?;
            let segment = self.active();
            match segment.append(&mut records, expected) {
                Ok(entries) => {
                    self.post_append(&entries)?;
                    return Ok(entries.iter().map(|e| e.offset).collect());
                }
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Appends already-framed message-set bytes without re-encoding.
    ///
    /// This is the replication-ingest path: it is allowed even when the log
    /// is readonly so a follower can keep reconciling with its leader.
    pub fn append_message_set(&self, ms: &[u8]) -> LogResult<Vec<Offset>> {
        if ms.is_empty() {
            return Ok(Vec::new());
        }
        loop {
            self.check_and_perform_split(ms.len() as u64)?;
            let segment = self.active();
            match segment.write_message_set(ms) {
                Ok(entries) => {
                    self.post_append(&entries)?;
                    return Ok(entries.iter().map(|e| e.offset).collect());
                }
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Records any new leader epochs carried by the appended entries and
    /// wakes LEO waiters.
    fn post_append(&self, entries: &[FrameEntry]) -> LogResult<()> {
        let mut last_epoch = self.epoch_cache.last_leader_epoch();
        for entry in entries {
            if entry.leader_epoch > last_epoch {
                self.epoch_cache.assign(entry.leader_epoch, entry.offset)?;
                last_epoch = entry.leader_epoch;
            }
        }
        for (_, waiter) in self.leo_waiters.lock().drain() {
            let _ = waiter.send(());
        }
        Ok(())
    }

    /// Rolls the active segment if it is due, retrying when a competing
    /// append performs the roll first. Returns true if a roll happened.
    fn check_and_perform_split(&self, incoming: u64) -> LogResult<bool> {
        loop {
            let active = self.active();
            if !active.should_roll(incoming, self.config.max_segment_age) {
                return Ok(false);
            }
            match self.split(&active) {
                Ok(()) => return Ok(true),
                Err(LogError::SegmentExists) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Seals `old` and swaps in a fresh active segment, failing with
    /// [`LogError::SegmentExists`] if another writer swapped first.
    fn split(&self, old: &Arc<Segment>) -> LogResult<()> {
        let mut segments = self.segments.write();
        let mut active = self.active.write();
        if !Arc::ptr_eq(&active, old) {
            return Err(LogError::SegmentExists);
        }
        // Sealing waits out any in-flight append, so the new base offset is
        // final.
        old.seal();
        let base = old.next_offset();
        debug!(log = %self.name, base = %base, "rolling new segment");
        let segment = Arc::new(Segment::create(
            &self.dir,
            base,
            self.config.max_segment_bytes,
            "",
        )?);
        *active = segment.clone();
        segments.push(segment);
        Ok(())
    }

    /// Reads up to `max` decoded records starting at `start`.
    ///
    /// Returns an empty vector when `start` is past the end of the log and
    /// [`LogError::EntryNotFound`] when it precedes the oldest offset.
    pub fn read(&self, start: Offset, max: usize) -> LogResult<Vec<Record>> {
        let start = if start.is_none() { Offset::new(0) } else { start };
        let oldest = self.oldest_offset();
        if !oldest.is_none() && start < oldest {
            return Err(LogError::EntryNotFound {
                lookup: "offset before log start",
            });
        }

        let segments = self.segments.read().clone();
        let idx = segment_index_for_offset(&segments, start);
        let mut out = Vec::new();
        for segment in &segments[idx..] {
            segment.read_records(start, max, &mut out)?;
            if out.len() >= max {
                break;
            }
        }
        Ok(out)
    }

    /// Reads raw message-set bytes starting at `start`, up to roughly
    /// `max_bytes`, for replication to a follower.
    pub fn read_message_set(&self, start: Offset, max_bytes: usize) -> LogResult<Bytes> {
        let start = if start.is_none() { Offset::new(0) } else { start };
        let segments = self.segments.read().clone();
        let mut idx = segment_index_for_offset(&segments, start);
        while idx < segments.len() {
            let data = segments[idx].read_raw_from(start, max_bytes)?;
            if !data.is_empty() {
                return Ok(data);
            }
            idx += 1;
        }
        Ok(Bytes::new())
    }

    /// Returns the earliest offset whose timestamp is at or after `ts`, or
    /// the next assignable offset when `ts` is beyond the end of the log.
    pub fn earliest_offset_after_timestamp(&self, ts: Timestamp) -> LogResult<Offset> {
        let segments = self.segments.read().clone();
        let idx = segment_index_for_timestamp(&segments, ts);
        for segment in &segments[idx..] {
            if let Some((offset, _)) = segment.find_entry_by_timestamp(ts) {
                return Ok(offset);
            }
        }
        Ok(self.log_end_offset())
    }

    /// Returns the latest offset whose timestamp is at or before `ts`.
    ///
    /// Fails with [`LogError::EntryNotFound`] when `ts` precedes the first
    /// record.
    pub fn latest_offset_before_timestamp(&self, ts: Timestamp) -> LogResult<Offset> {
        let segments = self.segments.read().clone();
        let idx = segment_index_for_timestamp(&segments, ts);
        for segment in &segments[idx..] {
            if let Some((offset, entry_ts)) = segment.find_entry_by_timestamp(ts) {
                if entry_ts == ts {
                    return Ok(offset);
                }
                return if offset <= self.oldest_offset() {
                    Err(LogError::EntryNotFound {
                        lookup: "timestamp before log start",
                    })
                } else {
                    Ok(offset.prev())
                };
            }
        }
        // Every record is older than the target.
        Ok(self.newest_offset())
    }

    /// Returns the high watermark, `NONE` if nothing is committed.
    #[must_use]
    pub fn high_watermark(&self) -> Offset {
        Offset::new(self.hw.lock().hw)
    }

    /// Advances the high watermark. Values at or below the current HW are
    /// ignored; waiters are woken on change.
    pub fn set_high_watermark(&self, hw: Offset) {
        let mut state = self.hw.lock();
        if hw.get() > state.hw {
            state.hw = hw.get();
            for (_, waiter) in state.waiters.drain() {
                let _ = waiter.send(false);
            }
        }
    }

    /// Sets the high watermark bypassing monotonicity. For tests and forced
    /// truncation only.
    pub fn override_high_watermark(&self, hw: Offset) {
        let mut state = self.hw.lock();
        state.hw = hw.get();
        for (_, waiter) in state.waiters.drain() {
            let _ = waiter.send(false);
        }
    }

    /// Registers a one-shot waiter for a high-watermark change.
    ///
    /// The receiver yields `false` when the HW has advanced past
    /// `current_hw` and `true` when the log became readonly with the HW
    /// caught up to the log end. If either condition already holds the
    /// waiter fires immediately.
    pub fn wait_for_hw(&self, waiter: WaiterId, current_hw: Offset) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.hw.lock();
        if state.hw != current_hw.get() {
            let _ = tx.send(false);
        } else if self.is_readonly() && state.hw == self.newest_offset().get() {
            let _ = tx.send(true);
        } else {
            state.waiters.insert(waiter, tx);
        }
        rx
    }

    /// Unregisters a parked HW waiter, e.g. when the caller's deadline
    /// fires.
    pub fn remove_hw_waiter(&self, waiter: WaiterId) {
        self.hw.lock().waiters.remove(&waiter);
    }

    /// Registers a one-shot waiter fired when records past `expected_leo`
    /// are appended. Fires immediately if the newest offset already
    /// differs. Used by follower fetchers to long-poll the leader.
    pub fn notify_leo(&self, waiter: WaiterId, expected_leo: Offset) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.leo_waiters.lock();
        if self.newest_offset() != expected_leo {
            let _ = tx.send(());
        } else {
            waiters.insert(waiter, tx);
        }
        rx
    }

    /// Unregisters a parked LEO waiter.
    pub fn remove_leo_waiter(&self, waiter: WaiterId) {
        self.leo_waiters.lock().remove(&waiter);
    }

    /// Marks the log readonly (or writable again).
    ///
    /// When readonly, producer appends fail but the replication-ingest path
    /// stays open. Committed readers parked at the log end are woken with
    /// the readonly signal once the HW covers the log end.
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::Release);
        if readonly {
            let mut state = self.hw.lock();
            if state.hw >= self.newest_offset().get() {
                for (_, waiter) in state.waiters.drain() {
                    let _ = waiter.send(true);
                }
            }
        }
    }

    /// Returns true if the log is readonly.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    /// Returns the latest leader epoch recorded in the log.
    #[must_use]
    pub fn last_leader_epoch(&self) -> LeaderEpoch {
        self.epoch_cache.last_leader_epoch()
    }

    /// Records that the log is entering a new leader epoch at the current
    /// log end offset.
    pub fn new_leader_epoch(&self, epoch: LeaderEpoch) -> LogResult<()> {
        self.epoch_cache.assign(epoch, self.log_end_offset())
    }

    /// Returns the exclusive end offset of `epoch`: the start offset of the
    /// next assigned epoch, or the log end offset when `epoch` is (at or
    /// past) the latest. Followers truncate to this offset on role change.
    #[must_use]
    pub fn last_offset_for_leader_epoch(&self, epoch: LeaderEpoch) -> Offset {
        let offset = self.epoch_cache.last_offset_for_leader_epoch(epoch);
        if offset.is_none() {
            self.log_end_offset()
        } else {
            offset
        }
    }

    /// Removes all records starting at `offset`.
    ///
    /// The segment containing `offset` is rewritten through the
    /// copy-and-swap protocol; later segments are deleted outright; the
    /// epoch cache drops entries past the truncation point.
    pub fn truncate(&self, offset: Offset) -> LogResult<()> {
        let mut segments = self.segments.write();
        let mut active = self.active.write();

        let Some(idx) = containing_segment_index(&segments, offset) else {
            return Ok(());
        };

        info!(log = %self.name, offset = %offset, "truncating log");
        for segment in segments.drain(idx + 1..) {
            segment.delete()?;
        }

        let target = segments[idx].clone();
        if target.base_offset() == offset && idx > 0 {
            target.delete()?;
            segments.truncate(idx);
        } else {
            // Copy the surviving prefix into a sibling and swap it in.
            let sibling = target.truncated()?;
            let mut scanner = target.scan()?;
            while let Some((frame, entry)) = scanner.next_frame()? {
                if entry.offset >= offset {
                    break;
                }
                sibling.write_message_set(&frame)?;
            }
            let replaced = Arc::new(sibling.replace(&target)?);
            segments.truncate(idx);
            segments.push(replaced);
        }

        *active = segments.last().expect("segment list is never empty").clone();
        drop(active);
        drop(segments);
        self.epoch_cache.clear_latest(offset)
    }

    /// Applies retention and, when enabled, compaction.
    pub fn clean(&self) -> LogResult<()> {
        let old_segments = self.segments.read().clone();
        let old_len = old_segments.len();

        let cleaned = self.delete_cleaner.clean(old_segments)?;
        let (mut cleaned, epoch_entries, compacted_end) = if self.config.compact {
            let CompactionResult {
                segments,
                epoch_entries,
                compacted_end,
            } = self.compactor.compact(self.high_watermark(), cleaned)?;
            (segments, epoch_entries, compacted_end)
        } else {
            (cleaned, None, Offset::NONE)
        };

        let mut segments = self.segments.write();
        if segments.len() > old_len {
            // Segments rolled while cleaning ran; graft them back on.
            cleaned.extend_from_slice(&segments[old_len..]);
        }
        *segments = cleaned;
        let oldest = segments
            .iter()
            .map(|s| s.first_offset())
            .find(|o| !o.is_none())
            .unwrap_or(Offset::NONE);
        drop(segments);

        // If compaction ran, the epoch cache is regenerated from its output
        // plus whatever the live cache knows past the compacted range.
        if let Some(mut entries) = epoch_entries {
            let last_epoch = entries.last().map(|e| e.epoch);
            for entry in self.epoch_cache.entries_from(compacted_end) {
                if last_epoch.map_or(true, |last| entry.epoch > last) {
                    entries.push(entry);
                }
            }
            self.epoch_cache.replace(entries)
        } else {
            self.epoch_cache.clear_earliest(oldest)
        }
    }

    /// Writes the current high watermark to disk atomically.
    pub fn checkpoint_hw(&self) -> LogResult<()> {
        let hw = self.hw.lock().hw;
        let path = self.dir.join(HW_CHECKPOINT_FILE_NAME);
        atomic_write(&path, format!("{hw}\n").as_bytes())
            .map_err(|e| LogError::io("checkpoint hw", e))
    }

    /// Returns true if the log has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Returns true if the log has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stops the background tasks, checkpoints the HW one final time and
    /// flushes all segments.
    pub async fn close(&self) -> LogResult<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        if !self.is_deleted() {
            self.checkpoint_hw()?;
            for segment in self.segments.read().iter() {
                segment.sync()?;
            }
        }
        Ok(())
    }

    /// Closes the log and removes all data from the filesystem.
    pub async fn delete(&self) -> LogResult<()> {
        self.deleted.store(true, Ordering::Release);
        self.close().await?;
        std::fs::remove_dir_all(&self.dir).map_err(|e| LogError::io("delete log dir", e))
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(checkpoint_loop(
            Arc::downgrade(self),
            self.closed.subscribe(),
        )));
        tasks.push(tokio::spawn(cleaner_loop(
            Arc::downgrade(self),
            self.closed.subscribe(),
        )));
    }
}

/// Index of the segment a read for `offset` should start in.
fn segment_index_for_offset(segments: &[Arc<Segment>], offset: Offset) -> usize {
    segments
        .partition_point(|s| s.base_offset() <= offset)
        .saturating_sub(1)
}

/// Index of the segment containing `offset`, or `None` if the offset is
/// past the end of the log.
fn containing_segment_index(segments: &[Arc<Segment>], offset: Offset) -> Option<usize> {
    let idx = segments.partition_point(|s| s.base_offset() <= offset);
    if idx == 0 {
        return None;
    }
    let idx = idx - 1;
    (offset < segments[idx].next_offset()).then_some(idx)
}

/// Index of the first segment that could contain a record with a timestamp
/// at or after the target, by binary search on first-record timestamps.
fn segment_index_for_timestamp(segments: &[Arc<Segment>], ts: Timestamp) -> usize {
    segments
        .partition_point(|s| {
            s.first_write_time()
                .is_some_and(|first| first.as_millis() <= ts.as_millis())
        })
        .saturating_sub(1)
}

async fn checkpoint_loop(log: Weak<CommitLog>, mut closed: watch::Receiver<bool>) {
    let Some(interval) = log.upgrade().map(|l| l.config.hw_checkpoint_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed.changed() => return,
        }
        let Some(log) = log.upgrade() else { return };
        if log.is_deleted() {
            return;
        }
        if let Err(e) = log.checkpoint_hw() {
            // Losing the HW checkpoint silently would break the commit
            // contract on restart.
            error!(log = %log.name, error = %e, "failed to checkpoint high watermark, aborting");
            std::process::abort();
        }
    }
}

async fn cleaner_loop(log: Weak<CommitLog>, mut closed: watch::Receiver<bool>) {
    let Some(interval) = log.upgrade().map(|l| l.config.cleaner_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Consume the immediate first tick; cleaning at open would race
    // recovery observers.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed.changed() => return,
        }
        let Some(log) = log.upgrade() else { return };
        if log.is_deleted() {
            return;
        }

        // An age-based roll may be due even with no appends arriving.
        match log.check_and_perform_split(0) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                error!(log = %log.name, error = %e, "failed to split log");
                continue;
            }
        }
        if let Err(e) = log.clean() {
            error!(log = %log.name, error = %e, "failed to clean log");
        }
    }
}
