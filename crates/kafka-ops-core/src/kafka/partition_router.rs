//! Request routing for multi-broker Kafka clusters.
//!
//! Partition requests (fetch, produce, list offsets) must go to the
//! partition leader and group requests to the group coordinator. The router
//! keeps both mappings plus a connection pool keyed by broker id, and
//! refreshes a stale mapping once when the broker says it is no longer the
//! right target.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::{codes, KafkaError};
use crate::types::{PipeRecord, TopicPartition};
use crate::Result;

use super::consumer_groups::{self, ConsumerGroup};
use super::metadata::{fetch_cluster_snapshot, BrokerMetadata, TopicMetadata};
use super::{FetchResponse, KafkaClient, ProduceResponse};

/// Routes Kafka requests to the broker that can serve them.
///
/// This router maintains:
/// - A mapping of (topic, partition) -> leader broker ID
/// - A mapping of group id -> coordinator broker ID
/// - A connection pool to all discovered brokers
pub struct PartitionLeaderRouter {
    /// Kafka configuration (for creating new connections)
    config: KafkaConfig,

    /// Map of broker_id -> BrokerMetadata (host:port info)
    broker_metadata: Arc<RwLock<HashMap<i32, BrokerMetadata>>>,

    /// Map of (topic, partition) -> leader broker_id
    partition_leaders: Arc<RwLock<HashMap<(String, i32), i32>>>,

    /// Map of group id -> coordinator broker_id
    coordinators: Arc<RwLock<HashMap<String, i32>>>,

    /// Connection pool: broker_id -> KafkaClient
    connections: Arc<RwLock<HashMap<i32, Arc<KafkaClient>>>>,

    /// Bootstrap client for metadata operations
    bootstrap_client: Arc<KafkaClient>,
}

impl PartitionLeaderRouter {
    /// Create a new router.
    ///
    /// This connects to the bootstrap servers, fetches cluster metadata,
    /// and builds the initial partition leader map.
    pub async fn new(config: KafkaConfig) -> Result<Self> {
        let bootstrap_client = Arc::new(KafkaClient::new(config.clone()));
        bootstrap_client.connect().await?;

        let router = Self {
            config,
            broker_metadata: Arc::new(RwLock::new(HashMap::new())),
            partition_leaders: Arc::new(RwLock::new(HashMap::new())),
            coordinators: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            bootstrap_client,
        };

        router.refresh_metadata().await?;

        Ok(router)
    }

    /// Refresh cluster metadata and rebuild the partition leader map.
    pub async fn refresh_metadata(&self) -> Result<()> {
        debug!("Refreshing cluster metadata");

        let snapshot = fetch_cluster_snapshot(&self.bootstrap_client, None).await?;

        {
            let mut broker_meta = self.broker_metadata.write().await;
            broker_meta.clear();
            for broker in snapshot.brokers {
                debug!(
                    "Discovered broker {}: {}:{}",
                    broker.node_id, broker.host, broker.port
                );
                broker_meta.insert(broker.node_id, broker);
            }
        }

        self.partition_leaders.write().await.clear();
        for topic in &snapshot.topics {
            self.record_leaders(topic).await;
        }

        info!(
            "Refreshed metadata: {} brokers, {} partition leaders",
            self.broker_metadata.read().await.len(),
            self.partition_leaders.read().await.len()
        );

        Ok(())
    }

    async fn record_leaders(&self, topic: &TopicMetadata) {
        let mut leaders = self.partition_leaders.write().await;
        for partition in &topic.partitions {
            leaders.insert(
                (topic.name.clone(), partition.partition_id),
                partition.leader_id,
            );
        }
    }

    /// Refresh the leader of one partition after a NOT_LEADER response.
    pub async fn refresh_partition_leader(&self, topic: &str, partition: i32) -> Result<()> {
        debug!("Refreshing leader for {}/{}", topic, partition);

        let snapshot = fetch_cluster_snapshot(&self.bootstrap_client, Some(&[topic.to_string()]))
            .await?;

        let leader = snapshot.partition(topic, partition);

        {
            let mut broker_meta = self.broker_metadata.write().await;
            for broker in snapshot.brokers {
                broker_meta.insert(broker.node_id, broker);
            }
        }

        match leader {
            Some(p) => {
                let stale = self
                    .partition_leaders
                    .write()
                    .await
                    .insert((topic.to_string(), partition), p.leader_id);
                if let Some(old) = stale.filter(|old| *old != p.leader_id) {
                    self.drop_connection(old).await;
                }
                info!(
                    "Updated leader for {}/{}: broker {}",
                    topic, partition, p.leader_id
                );
                Ok(())
            }
            None => Err(KafkaError::PartitionNotAvailable {
                topic: topic.to_string(),
                partition,
            }
            .into()),
        }
    }

    /// Get the leader broker ID for a partition.
    pub async fn get_leader(&self, topic: &str, partition: i32) -> Result<i32> {
        let leaders = self.partition_leaders.read().await;
        leaders
            .get(&(topic.to_string(), partition))
            .copied()
            .ok_or_else(|| {
                KafkaError::PartitionNotAvailable {
                    topic: topic.to_string(),
                    partition,
                }
                .into()
            })
    }

    /// Get or create a connection to a specific broker.
    async fn get_broker_connection(&self, broker_id: i32) -> Result<Arc<KafkaClient>> {
        {
            let connections = self.connections.read().await;
            if let Some(client) = connections.get(&broker_id) {
                return Ok(Arc::clone(client));
            }
        }

        let broker_addr = {
            let brokers = self.broker_metadata.read().await;
            let broker = brokers
                .get(&broker_id)
                .ok_or_else(|| KafkaError::Protocol(format!("Unknown broker ID: {}", broker_id)))?;
            broker.address()
        };

        self.connect_broker(broker_id, broker_addr).await
    }

    async fn connect_broker(&self, broker_id: i32, address: String) -> Result<Arc<KafkaClient>> {
        debug!(
            "Creating new connection to broker {} at {}",
            broker_id, address
        );

        let mut broker_config = self.config.clone();
        broker_config.bootstrap_servers = vec![address];

        let client = Arc::new(KafkaClient::new(broker_config));
        client.connect().await?;

        self.connections
            .write()
            .await
            .insert(broker_id, Arc::clone(&client));

        Ok(client)
    }

    async fn drop_connection(&self, broker_id: i32) {
        if self.connections.write().await.remove(&broker_id).is_some() {
            debug!("Dropped pooled connection to broker {}", broker_id);
        }
    }

    /// Get a client connected to the partition's leader broker.
    pub async fn get_leader_client(&self, topic: &str, partition: i32) -> Result<Arc<KafkaClient>> {
        let leader_id = match self.get_leader(topic, partition).await {
            Ok(id) => id,
            Err(_) => {
                // Partition may have been created after the last refresh
                self.refresh_partition_leader(topic, partition).await?;
                self.get_leader(topic, partition).await?
            }
        };
        self.get_broker_connection(leader_id).await
    }

    /// Run `op` against the partition leader, refreshing the leader and
    /// retrying once if the broker reports it is no longer the leader.
    async fn with_leader<T, F, Fut>(&self, topic: &str, partition: i32, op: F) -> Result<T>
    where
        F: Fn(Arc<KafkaClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.get_leader_client(topic, partition).await?;
        match op(client).await {
            Err(e) if is_not_leader_error(&e) => {
                warn!(
                    "Stale leader for {}/{}, refreshing metadata: {}",
                    topic, partition, e
                );
                self.refresh_partition_leader(topic, partition).await?;
                let client = self.get_leader_client(topic, partition).await?;
                op(client).await
            }
            other => other,
        }
    }

    /// Fetch records from a partition, routing to the correct leader.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
    ) -> Result<FetchResponse> {
        self.with_leader(topic, partition, |client| async move {
            client.fetch(topic, partition, offset, max_bytes).await
        })
        .await
    }

    /// Get the earliest and latest offsets for a partition.
    pub async fn get_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        self.with_leader(topic, partition, |client| async move {
            client.get_offsets(topic, partition).await
        })
        .await
    }

    /// Earliest offset with a timestamp at or after `timestamp_ms`.
    pub async fn offset_for_timestamp(
        &self,
        topic: &str,
        partition: i32,
        timestamp_ms: i64,
    ) -> Result<Option<i64>> {
        self.with_leader(topic, partition, |client| async move {
            super::fetch::offset_for_timestamp(&client, topic, partition, timestamp_ms).await
        })
        .await
    }

    /// Produce records to a partition, routing to the correct leader.
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        records: &[PipeRecord],
        preserve_timestamps: bool,
    ) -> Result<ProduceResponse> {
        self.with_leader(topic, partition, |client| async move {
            client
                .produce(topic, partition, records, preserve_timestamps)
                .await
        })
        .await
    }

    /// Get a client connected to the coordinator of `group_id`.
    pub async fn coordinator_client(&self, group_id: &str) -> Result<Arc<KafkaClient>> {
        let cached = self.coordinators.read().await.get(group_id).copied();
        if let Some(node_id) = cached {
            if let Ok(client) = self.get_broker_connection(node_id).await {
                return Ok(client);
            }
        }

        let coordinator = consumer_groups::find_coordinator(&self.bootstrap_client, group_id).await?;
        self.coordinators
            .write()
            .await
            .insert(group_id.to_string(), coordinator.node_id);

        let pooled = self
            .connections
            .read()
            .await
            .get(&coordinator.node_id)
            .cloned();
        match pooled {
            Some(client) => Ok(client),
            None => {
                self.connect_broker(coordinator.node_id, coordinator.address())
                    .await
            }
        }
    }

    /// Forget the coordinator of `group_id` so the next call rediscovers it.
    pub async fn invalidate_coordinator(&self, group_id: &str) {
        if let Some(node_id) = self.coordinators.write().await.remove(group_id) {
            debug!(
                "Invalidated coordinator {} for group {}",
                node_id, group_id
            );
        }
    }

    /// Run `op` against the group coordinator, rediscovering the coordinator
    /// and retrying once if the broker says it no longer owns the group.
    pub async fn with_coordinator<T, F, Fut>(&self, group_id: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<KafkaClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.coordinator_client(group_id).await?;
        match op(client).await {
            Err(e) if is_not_coordinator_error(&e) => {
                warn!(
                    "Coordinator for group {} moved, rediscovering: {}",
                    group_id, e
                );
                self.invalidate_coordinator(group_id).await;
                let client = self.coordinator_client(group_id).await?;
                op(client).await
            }
            other => other,
        }
    }

    /// List consumer groups across every broker, since each broker only
    /// reports the groups it coordinates.
    pub async fn list_groups(&self) -> Result<Vec<ConsumerGroup>> {
        let broker_ids: Vec<i32> = self.broker_metadata.read().await.keys().copied().collect();

        let mut seen = BTreeSet::new();
        let mut groups = Vec::new();
        for broker_id in broker_ids {
            let client = self.get_broker_connection(broker_id).await?;
            for group in consumer_groups::list_groups(&client).await? {
                if seen.insert(group.group_id.clone()) {
                    groups.push(group);
                }
            }
        }
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        Ok(groups)
    }

    /// Partitions of `topic`, sorted. Their leaders are recorded on the way.
    pub async fn topic_partitions(&self, topic: &str) -> Result<Vec<TopicPartition>> {
        let snapshot =
            fetch_cluster_snapshot(&self.bootstrap_client, Some(&[topic.to_string()])).await?;
        let metadata = snapshot
            .topic(topic)
            .ok_or_else(|| KafkaError::TopicNotExists(topic.to_string()))?;
        let partitions = metadata.topic_partitions()?;
        self.record_leaders(metadata).await;
        Ok(partitions)
    }
}

fn is_not_leader_error(error: &crate::Error) -> bool {
    matches!(
        error,
        crate::Error::Kafka(KafkaError::BrokerError { code, .. })
            if *code == codes::NOT_LEADER_OR_FOLLOWER || *code == codes::LEADER_NOT_AVAILABLE
    )
}

fn is_not_coordinator_error(error: &crate::Error) -> bool {
    matches!(
        error,
        crate::Error::Kafka(KafkaError::BrokerError { code, .. })
            if *code == codes::NOT_COORDINATOR || *code == codes::COORDINATOR_NOT_AVAILABLE
    )
}
