//! Committed-read consumer.
//!
//! A [`Subscriber`] yields records in offset order, never past the high
//! watermark. When it reaches the HW it parks on the log's HW notifier and
//! resumes as soon as more records commit. Consuming a readonly log
//! through its end surfaces [`ClusterError::EndOfReadonlyLog`].

use std::sync::Arc;

use rill_core::{Offset, Record, Timestamp};
use rill_log::CommitLog;

use crate::error::{ClusterError, ClusterResult};
use crate::partition::next_waiter_id;

/// Where a subscription begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    /// The oldest available record.
    Earliest,
    /// Only records published after subscribing.
    Latest,
    /// A specific offset.
    Offset(Offset),
    /// The earliest record with a timestamp at or after the given time.
    Timestamp(Timestamp),
}

/// An ordered, committed-only cursor over one partition log.
pub struct Subscriber {
    log: Arc<CommitLog>,
    next_offset: Offset,
}

impl Subscriber {
    /// Creates a subscriber positioned according to `policy`.
    pub fn new(log: Arc<CommitLog>, policy: StartPolicy) -> ClusterResult<Self> {
        let next_offset = match policy {
            StartPolicy::Earliest => {
                let oldest = log.oldest_offset();
                if oldest.is_none() {
                    Offset::new(0)
                } else {
                    oldest
                }
            }
            StartPolicy::Latest => log.log_end_offset(),
            StartPolicy::Offset(offset) => offset,
            StartPolicy::Timestamp(ts) => log.earliest_offset_after_timestamp(ts)?,
        };
        Ok(Self { log, next_offset })
    }

    /// Returns the offset the next record will be read from.
    #[must_use]
    pub const fn position(&self) -> Offset {
        self.next_offset
    }

    /// Returns the next batch of committed records, at most `max` of them,
    /// blocking until at least one is available.
    ///
    /// Fails with [`ClusterError::EndOfReadonlyLog`] once a readonly log
    /// has been fully consumed, and [`ClusterError::Closed`] if the log
    /// shuts down underneath the subscriber.
    pub async fn next_batch(&mut self, max: usize) -> ClusterResult<Vec<Record>> {
        loop {
            let hw = self.log.high_watermark();
            if self.next_offset <= hw {
                let records: Vec<Record> = self
                    .log
                    .read(self.next_offset, max)?
                    .into_iter()
                    .filter(|r| r.offset <= hw)
                    .collect();
                if let Some(last) = records.last() {
                    self.next_offset = last.offset.next();
                    return Ok(records);
                }
            }

            let waiter = next_waiter_id();
            let rx = self.log.wait_for_hw(waiter, hw);
            match rx.await {
                Ok(false) => {}
                Ok(true) => return Err(ClusterError::EndOfReadonlyLog),
                Err(_) => return Err(ClusterError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_log::LogConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    fn quiet_config() -> LogConfig {
        LogConfig::new()
            .with_hw_checkpoint_interval(Duration::from_secs(3600))
            .with_cleaner_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_subscriber_reads_only_committed() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path().join("p0"), quiet_config()).unwrap();
        log.append(vec![Record::new("a"), Record::new("b"), Record::new("c")])
            .unwrap();
        log.set_high_watermark(Offset::new(1));

        let mut subscriber = Subscriber::new(log.clone(), StartPolicy::Earliest).unwrap();
        let batch = subscriber.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].offset, Offset::new(1));

        // The third record becomes visible once the HW advances.
        let log2 = log.clone();
        let waiter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            log2.set_high_watermark(Offset::new(2));
        });
        let batch = subscriber.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, Offset::new(2));
        waiter.await.unwrap();
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_latest_skips_existing() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path().join("p0"), quiet_config()).unwrap();
        log.append(vec![Record::new("old")]).unwrap();
        log.set_high_watermark(Offset::new(0));

        let mut subscriber = Subscriber::new(log.clone(), StartPolicy::Latest).unwrap();
        assert_eq!(subscriber.position(), Offset::new(1));

        log.append(vec![Record::new("new")]).unwrap();
        log.set_high_watermark(Offset::new(1));
        let batch = subscriber.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value.as_deref(), Some(&b"new"[..]));
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_readonly_end() {
        let dir = tempdir().unwrap();
        let log = CommitLog::open(dir.path().join("p0"), quiet_config()).unwrap();
        log.append(vec![Record::new("a")]).unwrap();
        log.set_high_watermark(Offset::new(0));

        let mut subscriber = Subscriber::new(log.clone(), StartPolicy::Earliest).unwrap();
        let batch = subscriber.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);

        log.set_readonly(true);
        let err = subscriber.next_batch(10).await.unwrap_err();
        assert!(matches!(err, ClusterError::EndOfReadonlyLog));
        log.close().await.unwrap();
    }
}
