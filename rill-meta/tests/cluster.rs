//! Multi-broker cluster tests over the in-memory bus and consensus:
//! placement, replication, ISR shrink/expand, leader failover and
//! pause/resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rill_cluster::{AckPolicy, ClusteringConfig, InMemoryBus, MessageBus, StartPolicy, Subscriber};
use rill_core::{BrokerId, Offset, PartitionId, Record};
use rill_log::LogConfig;
use rill_meta::{
    ConsensusApplier, ConsensusLog, CreateStreamRequest, LocalConsensus, MetadataConfig,
    MetadataPlane,
};
use tempfile::{tempdir, TempDir};

struct TestCluster {
    dir: TempDir,
    bus: Arc<InMemoryBus>,
    consensus: LocalConsensus,
    clustering: ClusteringConfig,
    brokers: HashMap<u64, Arc<MetadataPlane>>,
}

impl TestCluster {
    async fn start(size: u64) -> Self {
        Self::start_with(size, ClusteringConfig::fast_for_testing()).await
    }

    async fn start_with(size: u64, clustering: ClusteringConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let mut cluster = Self {
            dir: tempdir().unwrap(),
            bus: InMemoryBus::new(),
            consensus: LocalConsensus::new(),
            clustering,
            brokers: HashMap::new(),
        };
        for id in 1..=size {
            cluster.add_broker(id).await;
        }
        cluster
    }

    async fn add_broker(&mut self, id: u64) -> Arc<MetadataPlane> {
        let broker = BrokerId::new(id);
        let config = MetadataConfig {
            broker,
            data_dir: self.dir.path().join(format!("broker-{id}")),
            clustering: self.clustering.clone(),
            log: LogConfig::new()
                .with_hw_checkpoint_interval(Duration::from_secs(3600))
                .with_cleaner_interval(Duration::from_secs(3600)),
        };
        let bus: Arc<dyn MessageBus> = self.bus.clone();
        let consensus: Arc<dyn ConsensusLog> = Arc::new(self.consensus.view(broker));
        let plane = MetadataPlane::new(config, bus, consensus);
        plane.start().await.unwrap();

        let applier: Arc<dyn ConsensusApplier> = plane.clone();
        self.consensus.register(broker, Arc::downgrade(&applier));
        plane.finish_recovery().await.unwrap();

        self.brokers.insert(id, plane.clone());
        plane
    }

    async fn kill(&mut self, id: u64) {
        self.consensus.remove(BrokerId::new(id));
        if let Some(plane) = self.brokers.remove(&id) {
            plane.shutdown().await;
        }
    }

    fn broker(&self, id: u64) -> &Arc<MetadataPlane> {
        &self.brokers[&id]
    }

    /// The broker currently leading the given partition, per the metadata
    /// leader's registry.
    fn partition_leader(&self, stream: &str, id: u64) -> Option<BrokerId> {
        self.brokers
            .values()
            .next()
            .and_then(|plane| plane.partition(stream, PartitionId::new(id)))
            .and_then(|p| p.leader().0)
    }

    async fn shutdown(mut self) {
        let ids: Vec<u64> = self.brokers.keys().copied().collect();
        for id in ids {
            if let Some(plane) = self.brokers.remove(&id) {
                plane.shutdown().await;
            }
        }
    }
}

async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

/// Waits until every listed broker has the partition with its HW at or
/// past `hw`.
async fn wait_for_hw(cluster: &TestCluster, stream: &str, partition: u64, hw: i64, ids: &[u64]) {
    wait_until("cluster HW", || {
        ids.iter().all(|id| {
            cluster
                .broker(*id)
                .partition(stream, PartitionId::new(partition))
                .is_some_and(|p| p.log().high_watermark() >= Offset::new(hw))
        })
    })
    .await;
}

async fn subscribe_values(
    plane: &Arc<MetadataPlane>,
    stream: &str,
    partition: u64,
    count: usize,
) -> Vec<String> {
    let target = plane
        .partition(stream, PartitionId::new(partition))
        .expect("partition missing");
    let mut subscriber = Subscriber::new(target.log().clone(), StartPolicy::Earliest).unwrap();
    let mut values = Vec::new();
    while values.len() < count {
        let batch = tokio::time::timeout(Duration::from_secs(5), subscriber.next_batch(64))
            .await
            .expect("subscriber starved")
            .unwrap();
        for record in batch {
            values.push(String::from_utf8_lossy(record.value.as_deref().unwrap()).to_string());
        }
    }
    values
}

#[tokio::test]
async fn create_stream_places_replicas_by_load() {
    let mut cluster = TestCluster::start(3).await;

    // Load counters update as each create applies, so successive streams
    // land on the least-loaded brokers.
    for name in ["orders", "payments", "shipments"] {
        cluster
            .broker(1)
            .create_stream(CreateStreamRequest {
                name: name.to_string(),
                subject: name.to_string(),
                partitions: 1,
                replication_factor: 2,
            })
            .await
            .unwrap();
    }

    // 3 streams x 2 replicas over 3 brokers: everyone hosts two.
    let counts = cluster.broker(1).broker_partition_counts();
    for id in 1..=3 {
        assert_eq!(
            counts.get(&BrokerId::new(id)).copied().unwrap_or(0),
            2,
            "unbalanced placement: {counts:?}"
        );
    }

    // Creating the same stream again is rejected.
    let err = cluster
        .broker(1)
        .create_stream(CreateStreamRequest {
            name: "orders".to_string(),
            subject: "orders".to_string(),
            partitions: 1,
            replication_factor: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, rill_meta::MetaError::StreamExists));

    cluster.shutdown().await;
}

#[tokio::test]
async fn non_leader_brokers_propagate_requests() {
    let mut cluster = TestCluster::start(3).await;

    // Broker 3 is not the metadata leader; the request is forwarded.
    cluster
        .broker(3)
        .create_stream(CreateStreamRequest {
            name: "events".to_string(),
            subject: "events".to_string(),
            partitions: 1,
            replication_factor: 3,
        })
        .await
        .unwrap();

    wait_until("stream visible on every broker", || {
        (1..=3).all(|id| {
            cluster
                .broker(id)
                .partition("events", PartitionId::new(0))
                .is_some()
        })
    })
    .await;

    let err = cluster
        .broker(2)
        .delete_stream("missing")
        .await
        .unwrap_err();
    assert!(matches!(err, rill_meta::MetaError::StreamNotFound));

    cluster.shutdown().await;
}

#[tokio::test]
async fn publish_replicates_to_full_isr() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .broker(1)
        .create_stream(CreateStreamRequest {
            name: "events".to_string(),
            subject: "events".to_string(),
            partitions: 1,
            replication_factor: 3,
        })
        .await
        .unwrap();

    let leader = cluster.partition_leader("events", 0).unwrap();
    let partition = cluster
        .broker(leader.get())
        .partition("events", PartitionId::new(0))
        .unwrap();

    for i in 0..50 {
        tokio::time::timeout(
            Duration::from_secs(5),
            partition.publish(
                vec![Record::with_key("k", i.to_string())],
                AckPolicy::All,
            ),
        )
        .await
        .expect("publish timed out")
        .unwrap();
    }

    wait_for_hw(&cluster, "events", 0, 49, &[1, 2, 3]).await;

    // Every replica reads back the identical sequence.
    for id in 1..=3 {
        let values = subscribe_values(cluster.broker(id), "events", 0, 50).await;
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(values, expected, "diverged on broker {id}");
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn isr_shrinks_on_dead_follower_and_expands_on_return() {
    let mut clustering = ClusteringConfig::fast_for_testing();
    clustering.min_isr = 2;
    let mut cluster = TestCluster::start_with(3, clustering).await;

    cluster
        .broker(1)
        .create_stream(CreateStreamRequest {
            name: "events".to_string(),
            subject: "events".to_string(),
            partitions: 1,
            replication_factor: 3,
        })
        .await
        .unwrap();

    let leader = cluster.partition_leader("events", 0).unwrap();
    let partition = cluster
        .broker(leader.get())
        .partition("events", PartitionId::new(0))
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        partition.publish(vec![Record::new("before")], AckPolicy::All),
    )
    .await
    .expect("initial publish timed out")
    .unwrap();

    // Kill a follower and publish again: the all-ISR ack must block until
    // the ISR shrinks to the two live replicas, then complete.
    let dead = (1..=3)
        .find(|id| BrokerId::new(*id) != leader)
        .unwrap();
    cluster.kill(dead).await;

    tokio::time::timeout(
        Duration::from_secs(8),
        partition.publish(vec![Record::new("after")], AckPolicy::All),
    )
    .await
    .expect("publish never unblocked after follower death")
    .unwrap();
    assert_eq!(partition.isr_size(), 2);
    assert!(!partition.in_isr(BrokerId::new(dead)));

    // Restart the follower: it catches up and rejoins the ISR.
    cluster.add_broker(dead).await;
    let partition_for_wait = partition.clone();
    wait_until("ISR back to 3", || partition_for_wait.isr_size() == 3).await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn leader_failover_preserves_committed_records() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .broker(1)
        .create_stream(CreateStreamRequest {
            name: "events".to_string(),
            subject: "events".to_string(),
            partitions: 2,
            replication_factor: 3,
        })
        .await
        .unwrap();

    let old_leader = cluster.partition_leader("events", 1).unwrap();
    let partition = cluster
        .broker(old_leader.get())
        .partition("events", PartitionId::new(1))
        .unwrap();

    let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    for value in &expected {
        tokio::time::timeout(
            Duration::from_secs(5),
            partition.publish(
                vec![Record::with_key("bar", value.clone())],
                AckPolicy::All,
            ),
        )
        .await
        .expect("publish timed out")
        .unwrap();
    }
    wait_for_hw(&cluster, "events", 1, 99, &[1, 2, 3]).await;

    let leader_counts_before = cluster.broker(1).broker_leader_counts();

    // Kill the partition leader; the followers witness the failure and the
    // metadata plane elects a replacement from the ISR.
    cluster.kill(old_leader.get()).await;
    let survivors: Vec<u64> = (1..=3).filter(|id| BrokerId::new(*id) != old_leader).collect();

    let surviving_plane = cluster.broker(survivors[0]).clone();
    wait_until("new leader elected", || {
        surviving_plane
            .partition("events", PartitionId::new(1))
            .and_then(|p| p.leader().0)
            .is_some_and(|leader| leader != old_leader)
    })
    .await;

    let new_leader = surviving_plane
        .partition("events", PartitionId::new(1))
        .unwrap()
        .leader()
        .0
        .unwrap();

    // The full committed sequence survives on the new leader.
    let values = subscribe_values(cluster.broker(new_leader.get()), "events", 1, 100).await;
    assert_eq!(values, expected);

    // Leadership load moved onto a survivor.
    wait_until("leader counts updated", || {
        let counts = surviving_plane.broker_leader_counts();
        counts.get(&new_leader).copied().unwrap_or(0)
            > leader_counts_before.get(&new_leader).copied().unwrap_or(0)
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn pause_then_resume_preserves_log_content() {
    let mut cluster = TestCluster::start(1).await;
    cluster
        .broker(1)
        .create_stream(CreateStreamRequest {
            name: "events".to_string(),
            subject: "events".to_string(),
            partitions: 1,
            replication_factor: 1,
        })
        .await
        .unwrap();

    let partition = cluster
        .broker(1)
        .partition("events", PartitionId::new(0))
        .unwrap();
    let expected: Vec<String> = (0..5).map(|i| format!("v{i}")).collect();
    for value in &expected {
        tokio::time::timeout(
            Duration::from_secs(5),
            partition.publish(vec![Record::new(value.clone())], AckPolicy::All),
        )
        .await
        .expect("publish timed out")
        .unwrap();
    }

    cluster
        .broker(1)
        .pause_stream("events", vec![PartitionId::new(0)])
        .await
        .unwrap();
    let plane = cluster.broker(1).clone();
    wait_until("partition paused", || {
        plane
            .partition("events", PartitionId::new(0))
            .is_some_and(|p| p.is_paused())
    })
    .await;

    cluster
        .broker(1)
        .resume_stream("events", vec![PartitionId::new(0)])
        .await
        .unwrap();
    wait_until("partition resumed", || {
        plane
            .partition("events", PartitionId::new(0))
            .is_some_and(|p| !p.is_paused() && p.is_leader())
    })
    .await;

    let values = subscribe_values(cluster.broker(1), "events", 0, 5).await;
    assert_eq!(values, expected);

    cluster.shutdown().await;
}

#[tokio::test]
async fn delete_stream_removes_data() {
    let mut cluster = TestCluster::start(1).await;
    cluster
        .broker(1)
        .create_stream(CreateStreamRequest {
            name: "events".to_string(),
            subject: "events".to_string(),
            partitions: 1,
            replication_factor: 1,
        })
        .await
        .unwrap();

    let partition = cluster
        .broker(1)
        .partition("events", PartitionId::new(0))
        .unwrap();
    partition
        .publish(vec![Record::new("doomed")], AckPolicy::All)
        .await
        .unwrap();
    drop(partition);

    cluster.broker(1).delete_stream("events").await.unwrap();
    let plane = cluster.broker(1).clone();
    wait_until("stream removed", || {
        plane.partition("events", PartitionId::new(0)).is_none()
    })
    .await;

    let stream_dir = cluster.dir.path().join("broker-1/streams/events");
    wait_until("data removed", || !stream_dir.exists()).await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn fetch_metadata_reports_brokers_and_streams() {
    let mut cluster = TestCluster::start(3).await;
    cluster
        .broker(1)
        .create_stream(CreateStreamRequest {
            name: "events".to_string(),
            subject: "events.subject".to_string(),
            partitions: 2,
            replication_factor: 3,
        })
        .await
        .unwrap();

    let response = cluster
        .broker(2)
        .fetch_metadata(vec!["events".to_string(), "ghost".to_string()])
        .await
        .unwrap();

    assert_eq!(response.brokers.len(), 3);
    let events = response.streams["events"].as_ref().expect("known stream");
    assert_eq!(events.subject, "events.subject");
    assert_eq!(events.partitions.len(), 2);
    assert!(response.streams["ghost"].is_none());

    // A second fetch with unchanged membership is served from the cache.
    let cached = cluster
        .broker(2)
        .fetch_metadata(vec!["events".to_string()])
        .await
        .unwrap();
    assert_eq!(cached.brokers.len(), 3);

    cluster.shutdown().await;
}
