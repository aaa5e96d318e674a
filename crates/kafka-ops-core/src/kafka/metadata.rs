//! Kafka Metadata API implementation.

use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{ApiKey, MetadataRequest, MetadataResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use tracing::debug;

use super::KafkaClient;
use crate::error::{codes, KafkaError};
use crate::types::TopicPartition;
use crate::Result;

/// Address of a broker
#[derive(Debug, Clone)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Leader of one partition
#[derive(Debug, Clone, Copy)]
pub struct PartitionMetadata {
    pub partition_id: i32,
    pub leader_id: i32,
}

/// A topic as reported by the broker. `error_code` is non-zero for topics
/// the broker could not describe, in which case `partitions` is empty.
#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub name: String,
    pub error_code: i16,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    /// Sorted partitions, or the error the broker reported for the topic.
    pub fn topic_partitions(&self) -> Result<Vec<TopicPartition>> {
        match self.error_code {
            codes::NONE => {}
            codes::UNKNOWN_TOPIC_OR_PARTITION => {
                return Err(KafkaError::TopicNotExists(self.name.clone()).into())
            }
            code => {
                return Err(KafkaError::BrokerError {
                    code,
                    message: format!("Metadata for topic {} failed", self.name),
                }
                .into())
            }
        }
        let mut partitions: Vec<_> = self
            .partitions
            .iter()
            .map(|p| TopicPartition::new(self.name.clone(), p.partition_id))
            .collect();
        partitions.sort();
        Ok(partitions)
    }
}

/// Brokers and topics from a single Metadata response
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

impl ClusterSnapshot {
    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn partition(&self, topic: &str, partition: i32) -> Option<PartitionMetadata> {
        self.topic(topic)?
            .partitions
            .iter()
            .find(|p| p.partition_id == partition)
            .copied()
    }
}

/// Fetch brokers plus `topics` (every topic when `None`) in one round trip.
pub async fn fetch_cluster_snapshot(
    client: &KafkaClient,
    topics: Option<&[String]>,
) -> Result<ClusterSnapshot> {
    let requested = topics.map(|names| {
        names
            .iter()
            .map(|name| {
                MetadataRequestTopic::default()
                    .with_name(Some(TopicName(StrBytes::from_string(name.clone()))))
            })
            .collect::<Vec<_>>()
    });
    let request = MetadataRequest::default()
        .with_topics(requested)
        .with_allow_auto_topic_creation(false);

    let response: MetadataResponse = client.send_request(ApiKey::Metadata, request).await?;

    let brokers: Vec<BrokerMetadata> = response
        .brokers
        .iter()
        .map(|broker| BrokerMetadata {
            node_id: broker.node_id.0,
            host: broker.host.to_string(),
            port: broker.port,
        })
        .collect();

    let topics: Vec<TopicMetadata> = response
        .topics
        .iter()
        .filter_map(|topic| {
            let name = topic.name.as_ref()?.to_string();
            if topic.error_code != codes::NONE {
                debug!("Topic {} has error code {}", name, topic.error_code);
            }
            Some(TopicMetadata {
                name,
                error_code: topic.error_code,
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| PartitionMetadata {
                        partition_id: p.partition_index,
                        leader_id: p.leader_id.0,
                    })
                    .collect(),
            })
        })
        .collect();

    debug!(
        "Metadata from {}: {} brokers, {} topics",
        client.servers(),
        brokers.len(),
        topics.len()
    );
    Ok(ClusterSnapshot { brokers, topics })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(error_code: i16, partitions: &[i32]) -> TopicMetadata {
        TopicMetadata {
            name: "orders".to_string(),
            error_code,
            partitions: partitions
                .iter()
                .map(|p| PartitionMetadata {
                    partition_id: *p,
                    leader_id: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_topic_partitions_sorted() {
        let partitions = topic(0, &[2, 0, 1]).topic_partitions().unwrap();
        assert_eq!(
            partitions,
            vec![
                TopicPartition::new("orders", 0),
                TopicPartition::new("orders", 1),
                TopicPartition::new("orders", 2),
            ]
        );
    }

    #[test]
    fn test_partition_lookup() {
        let snapshot = ClusterSnapshot {
            brokers: vec![BrokerMetadata {
                node_id: 1,
                host: "kafka-1".to_string(),
                port: 9092,
            }],
            topics: vec![topic(0, &[0, 1])],
        };

        let leader = snapshot.partition("orders", 1).map(|p| p.leader_id);
        assert_eq!(leader, Some(1));
        assert_eq!(snapshot.brokers[0].address(), "kafka-1:9092");
    }

    #[test]
    fn test_partition_lookup_misses() {
        let snapshot = ClusterSnapshot {
            brokers: Vec::new(),
            topics: vec![topic(0, &[0])],
        };
        assert!(snapshot.partition("orders", 3).is_none());
        assert!(snapshot.partition("payments", 0).is_none());
    }

    #[test]
    fn test_unknown_topic_error() {
        let err = topic(3, &[]).topic_partitions().unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Kafka(KafkaError::TopicNotExists(ref t)) if t == "orders"
        ));

        let err = topic(29, &[]).topic_partitions().unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Kafka(KafkaError::BrokerError { code: 29, .. })
        ));
    }
}
