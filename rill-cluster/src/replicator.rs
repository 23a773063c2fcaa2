//! Leader-side replication.
//!
//! When a broker becomes leader for a partition it starts a
//! [`ReplicationServer`]: one task serving follower fetches and epoch-end
//! queries off the bus, and one periodic task watching each follower for
//! lag. A follower fetch with no data available parks on the log's LEO
//! notifier, so an outstanding long-poll returns the moment a producer
//! appends; followers without an outstanding poll get an asynchronous
//! "new data available" hint instead.
//!
//! The leader advances the high watermark to the minimum log end across
//! the ISR, and asks the metadata plane to shrink the ISR when a follower
//! lags (or idles) past `replica_max_lag_time` and to expand it when a
//! removed follower catches back up.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rill_core::{BrokerId, LeaderEpoch, Offset, PartitionId};
use rill_log::CommitLog;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{BusMessage, Subscription};
use crate::config::ClusteringConfig;
use crate::error::ClusterResult;
use crate::partition::{next_waiter_id, Partition};
use crate::rpc::{
    leader_epoch_offset_subject, notification_subject, replication_subject,
    LeaderEpochOffsetRequest, LeaderEpochOffsetResponse, PartitionNotification,
    ReplicationRequest, ReplicationResponse,
};
use crate::MessageBus;

/// Per-follower replication state tracked on the leader.
#[derive(Debug, Clone, Copy)]
struct FollowerState {
    /// Last time any fetch arrived from the follower.
    last_seen: Instant,
    /// Last time the follower was caught up to the log end.
    last_caught_up: Instant,
    /// The follower's newest offset, from its last fetch. -1 until the
    /// first fetch arrives.
    newest: i64,
    /// True while a long-poll from this follower is parked.
    outstanding: bool,
}

impl FollowerState {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            last_caught_up: now,
            newest: -1,
            outstanding: false,
        }
    }
}

/// Serves replication for one partition while this broker is its leader.
pub(crate) struct ReplicationServer {
    partition: Weak<Partition>,
    log: Arc<CommitLog>,
    bus: Arc<dyn MessageBus>,
    config: ClusteringConfig,
    broker: BrokerId,
    stream: String,
    id: PartitionId,
    leader_epoch: LeaderEpoch,
    followers: Mutex<HashMap<BrokerId, FollowerState>>,
}

/// Handle owning the replication server's tasks.
#[derive(Clone)]
pub(crate) struct ReplicationServerHandle {
    server: Arc<ReplicationServer>,
    closed: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ReplicationServerHandle {
    /// Signals all server tasks to stop. Parked long-polls resolve within
    /// one hold interval.
    pub(crate) fn stop(&self) {
        let _ = self.closed.send(true);
        for task in self.tasks.lock().drain(..) {
            drop(task);
        }
    }

    /// Recomputes the high watermark from the ISR's replication progress.
    pub(crate) fn recompute_hw(&self) {
        self.server.recompute_hw();
    }

    /// Sends "new data available" hints to followers with no outstanding
    /// long-poll.
    pub(crate) fn notify_followers(&self) {
        let server = self.server.clone();
        tokio::spawn(async move {
            server.notify_followers().await;
        });
    }
}

impl ReplicationServer {
    /// Subscribes to the partition's replication subjects and starts the
    /// serve and lag-monitor tasks.
    pub(crate) async fn start(partition: &Arc<Partition>) -> ClusterResult<ReplicationServerHandle> {
        let (leader, leader_epoch) = partition.leader();
        debug_assert_eq!(leader, Some(partition.broker()));

        let stream = partition.stream().to_string();
        let id = partition.id();
        let bus = partition.bus().clone();
        let fetch_sub = bus.subscribe(&replication_subject(&stream, id)).await?;
        let epoch_sub = bus
            .subscribe(&leader_epoch_offset_subject(&stream, id))
            .await?;

        let now = Instant::now();
        let followers = partition
            .replicas()
            .into_iter()
            .filter(|r| *r != partition.broker())
            .map(|r| (r, FollowerState::new(now)))
            .collect();

        let server = Arc::new(Self {
            partition: Arc::downgrade(partition),
            log: partition.log().clone(),
            bus,
            config: partition.clustering().clone(),
            broker: partition.broker(),
            stream,
            id,
            leader_epoch,
            followers: Mutex::new(followers),
        });
        // The leader itself bounds the HW for a single-replica ISR.
        server.recompute_hw();

        let (closed, _) = watch::channel(false);
        let tasks = Arc::new(Mutex::new(vec![
            tokio::spawn(serve_loop(
                server.clone(),
                fetch_sub,
                epoch_sub,
                closed.subscribe(),
            )),
            tokio::spawn(monitor_loop(server.clone(), closed.subscribe())),
        ]));

        Ok(ReplicationServerHandle {
            server,
            closed,
            tasks,
        })
    }

    /// Advances the HW to the minimum replicated offset across the ISR.
    fn recompute_hw(&self) {
        let Some(partition) = self.partition.upgrade() else {
            return;
        };
        let mut hw = self.log.newest_offset().get();
        let followers = self.followers.lock();
        for member in partition.isr() {
            if member == self.broker {
                continue;
            }
            let newest = followers.get(&member).map_or(-1, |f| f.newest);
            hw = hw.min(newest);
        }
        drop(followers);
        if hw >= 0 {
            self.log.set_high_watermark(Offset::new(hw));
        }
    }

    async fn notify_followers(&self) {
        let idle: Vec<BrokerId> = {
            let followers = self.followers.lock();
            followers
                .iter()
                .filter(|(_, f)| !f.outstanding)
                .map(|(b, _)| *b)
                .collect()
        };
        let payload = PartitionNotification {
            stream: self.stream.clone(),
            partition: self.id,
        }
        .encode();
        for follower in idle {
            let subject = notification_subject(follower, &self.stream, self.id);
            if let Err(e) = self.bus.publish(&subject, payload.clone()).await {
                debug!(follower = %follower, error = %e, "failed to send data hint");
            }
        }
    }

    /// Handles one follower fetch: record progress, long-poll if the
    /// follower is at the log end, reply with raw frames and the HW.
    async fn handle_fetch(self: Arc<Self>, request: ReplicationRequest, reply: BusMessage) {
        let Some(reply) = reply.reply else { return };
        let Some(partition) = self.partition.upgrade() else {
            reply.respond(ReplicationResponse::not_leader().encode());
            return;
        };
        if !partition.is_leader() {
            reply.respond(ReplicationResponse::not_leader().encode());
            return;
        }

        let now = Instant::now();
        let leo = self.log.log_end_offset();
        let caught_up = request.offset >= leo;
        let was_in_isr = partition.in_isr(request.replica);
        {
            let mut followers = self.followers.lock();
            let state = followers
                .entry(request.replica)
                .or_insert_with(|| FollowerState::new(now));
            state.last_seen = now;
            state.newest = request.offset.get() - 1;
            if caught_up {
                state.last_caught_up = now;
            }
        }
        self.recompute_hw();

        // A lagging replica that has caught back up rejoins the ISR.
        if caught_up && !was_in_isr {
            let server = self.clone();
            let replica = request.replica;
            tokio::spawn(async move {
                if let Err(e) = server
                    .reporter_expand(replica)
                    .await
                {
                    warn!(replica = %replica, error = %e, "failed to request ISR expand");
                }
            });
        }

        let mut data = self
            .log
            .read_message_set(request.offset, self.config.fetch_max_bytes)
            .unwrap_or_default();
        if data.is_empty() {
            // Park until a producer appends or the hold expires.
            self.set_outstanding(request.replica, true);
            let waiter = next_waiter_id();
            let notified = self.log.notify_leo(waiter, request.offset.prev());
            let _ = tokio::time::timeout(self.config.replica_fetch_timeout, notified).await;
            self.log.remove_leo_waiter(waiter);
            self.set_outstanding(request.replica, false);
            data = self
                .log
                .read_message_set(request.offset, self.config.fetch_max_bytes)
                .unwrap_or_default();
        }

        reply.respond(
            ReplicationResponse {
                ok: true,
                leader_epoch: self.leader_epoch,
                hw: self.log.high_watermark(),
                data,
            }
            .encode(),
        );
    }

    async fn reporter_expand(&self, replica: BrokerId) -> ClusterResult<()> {
        let Some(partition) = self.partition.upgrade() else {
            return Ok(());
        };
        partition
            .reporter()
            .expand_isr(&self.stream, self.id, replica, self.broker, self.leader_epoch)
            .await
    }

    fn set_outstanding(&self, replica: BrokerId, outstanding: bool) {
        if let Some(state) = self.followers.lock().get_mut(&replica) {
            state.outstanding = outstanding;
        }
    }
}

async fn serve_loop(
    server: Arc<ReplicationServer>,
    mut fetch_sub: Subscription,
    mut epoch_sub: Subscription,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = closed.changed() => return,
            msg = fetch_sub.recv() => {
                let Some(msg) = msg else { return };
                match ReplicationRequest::decode(msg.data.clone()) {
                    Ok(request) => {
                        // Long-polls park; serve each fetch on its own task
                        // so one slow follower never blocks the others.
                        tokio::spawn(server.clone().handle_fetch(request, msg));
                    }
                    Err(e) => warn!(error = %e, "bad replication request"),
                }
            }
            msg = epoch_sub.recv() => {
                let Some(msg) = msg else { return };
                let Some(reply) = msg.reply else { continue };
                match LeaderEpochOffsetRequest::decode(msg.data) {
                    Ok(request) => {
                        let end_offset =
                            server.log.last_offset_for_leader_epoch(request.leader_epoch);
                        reply.respond(LeaderEpochOffsetResponse { end_offset }.encode());
                    }
                    Err(e) => warn!(error = %e, "bad epoch offset request"),
                }
            }
        }
    }
}

/// Watches follower progress, requesting an ISR shrink for any in-sync
/// follower that has lagged or idled past `replica_max_lag_time`.
async fn monitor_loop(server: Arc<ReplicationServer>, mut closed: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(server.config.replica_max_idle_wait);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed.changed() => return,
        }
        let Some(partition) = server.partition.upgrade() else {
            return;
        };
        if !partition.is_leader() {
            return;
        }

        let now = Instant::now();
        let lagging: Vec<BrokerId> = {
            let followers = server.followers.lock();
            partition
                .isr()
                .into_iter()
                .filter(|member| *member != server.broker)
                .filter(|member| {
                    followers.get(member).map_or(true, |f| {
                        now.duration_since(f.last_caught_up) > server.config.replica_max_lag_time
                            || now.duration_since(f.last_seen)
                                > server.config.replica_max_lag_time
                    })
                })
                .collect()
        };

        for replica in lagging {
            warn!(
                stream = %server.stream, partition = %server.id, replica = %replica,
                "follower lagging, requesting ISR shrink"
            );
            if let Err(e) = partition
                .reporter()
                .shrink_isr(
                    &server.stream,
                    server.id,
                    replica,
                    server.broker,
                    server.leader_epoch,
                )
                .await
            {
                warn!(replica = %replica, error = %e, "failed to request ISR shrink");
            }
        }
    }
}
