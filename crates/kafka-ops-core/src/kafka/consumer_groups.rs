//! Consumer group operations for offset management.
//!
//! Requests in this module other than FindCoordinator must be sent to the
//! group's coordinator:
//! - FindCoordinator: Locate the coordinator broker for a group
//! - ListGroups: List consumer groups known to a broker
//! - DescribeGroups: Get consumer group details
//! - OffsetFetch: Get committed offsets for a group
//! - OffsetCommit: Commit offsets for a group
//! - OffsetDelete: Remove committed offsets of an empty group

use bytes::Buf;
use kafka_protocol::messages::{
    ApiKey, DescribeGroupsRequest, DescribeGroupsResponse, FindCoordinatorRequest,
    FindCoordinatorResponse, GroupId, ListGroupsRequest, ListGroupsResponse, OffsetCommitRequest,
    OffsetCommitResponse, OffsetDeleteRequest, OffsetDeleteResponse, OffsetFetchRequest,
    OffsetFetchResponse, TopicName,
};
use kafka_protocol::messages::offset_delete_request::{
    OffsetDeleteRequestPartition, OffsetDeleteRequestTopic,
};
use kafka_protocol::protocol::StrBytes;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::KafkaClient;
use crate::error::KafkaError;
use crate::types::{GroupMember, TopicPartition};
use crate::Result;

/// Group coordinator location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinator {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl Coordinator {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Consumer group metadata
#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    /// Consumer group ID
    pub group_id: String,
    /// Protocol type (e.g., "consumer")
    pub protocol_type: String,
    /// Group state (e.g., "Stable", "Empty", "Dead")
    pub state: Option<String>,
}

/// Detailed consumer group description
#[derive(Debug, Clone)]
pub struct ConsumerGroupDescription {
    /// Consumer group ID
    pub group_id: String,
    /// Group state
    pub state: String,
    /// Protocol type
    pub protocol_type: String,
    /// Protocol name (e.g., "range", "roundrobin")
    pub protocol: String,
    /// Group members with decoded subscriptions and assignments
    pub members: Vec<GroupMember>,
    /// Error code (0 = success)
    pub error_code: i16,
}

/// Committed offset for a partition
#[derive(Debug, Clone)]
pub struct CommittedOffset {
    /// Topic name
    pub topic: String,
    /// Partition ID
    pub partition: i32,
    /// Committed offset
    pub offset: i64,
    /// Commit metadata
    pub metadata: Option<String>,
    /// Error code (0 = success)
    pub error_code: i16,
}

/// Locate the coordinator broker for a consumer group.
pub async fn find_coordinator(client: &KafkaClient, group_id: &str) -> Result<Coordinator> {
    let request = FindCoordinatorRequest::default()
        .with_key(StrBytes::from_string(group_id.to_string()))
        .with_key_type(0);

    let response: FindCoordinatorResponse =
        client.send_request(ApiKey::FindCoordinator, request).await?;

    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!(
                "FindCoordinator for group {} failed: {}",
                group_id,
                response
                    .error_message
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("error code {}", response.error_code))
            ),
        }
        .into());
    }

    let coordinator = Coordinator {
        node_id: response.node_id.0,
        host: response.host.to_string(),
        port: response.port,
    };
    debug!(
        "Coordinator for group {} is broker {} at {}",
        group_id,
        coordinator.node_id,
        coordinator.address()
    );
    Ok(coordinator)
}

/// List the consumer groups coordinated by the broker `client` talks to
pub async fn list_groups(client: &KafkaClient) -> Result<Vec<ConsumerGroup>> {
    let request = ListGroupsRequest::default();

    let response: ListGroupsResponse = client.send_request(ApiKey::ListGroups, request).await?;

    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!("ListGroups failed with error code {}", response.error_code),
        }
        .into());
    }

    let group_count = response.groups.len();
    let groups = response
        .groups
        .into_iter()
        .map(|g| ConsumerGroup {
            group_id: g.group_id.to_string(),
            protocol_type: g.protocol_type.to_string(),
            state: if g.group_state.is_empty() {
                None
            } else {
                Some(g.group_state.to_string())
            },
        })
        .collect();

    debug!("Listed {} consumer groups", group_count);
    Ok(groups)
}

/// Describe consumer groups
pub async fn describe_groups(
    client: &KafkaClient,
    group_ids: &[String],
) -> Result<Vec<ConsumerGroupDescription>> {
    let groups: Vec<GroupId> = group_ids
        .iter()
        .map(|id| GroupId(StrBytes::from_string(id.clone())))
        .collect();

    let request = DescribeGroupsRequest::default().with_groups(groups);

    let response: DescribeGroupsResponse =
        client.send_request(ApiKey::DescribeGroups, request).await?;

    let descriptions = response
        .groups
        .into_iter()
        .map(|g| {
            let is_consumer = g.protocol_type.as_str() == CONSUMER_PROTOCOL_TYPE;
            let members = g
                .members
                .into_iter()
                .map(|m| {
                    let (subscriptions, assignment) = if is_consumer {
                        (
                            parse_member_subscription(&m.member_metadata),
                            parse_member_assignment(&m.member_assignment),
                        )
                    } else {
                        (Vec::new(), Vec::new())
                    };

                    GroupMember {
                        member_id: m.member_id.to_string(),
                        client_id: m.client_id.to_string(),
                        client_host: m.client_host.to_string(),
                        subscriptions,
                        assignment,
                    }
                })
                .collect();

            ConsumerGroupDescription {
                group_id: g.group_id.to_string(),
                state: g.group_state.to_string(),
                protocol_type: g.protocol_type.to_string(),
                protocol: g.protocol_data.to_string(),
                members,
                error_code: g.error_code,
            }
        })
        .collect();

    Ok(descriptions)
}

/// Fetch every committed offset of a consumer group. Partitions the group
/// never committed are not returned.
pub async fn fetch_offsets(client: &KafkaClient, group_id: &str) -> Result<Vec<CommittedOffset>> {
    let request = OffsetFetchRequest::default()
        .with_group_id(GroupId(StrBytes::from_string(group_id.to_string())))
        .with_topics(None);

    let response: OffsetFetchResponse = client.send_request(ApiKey::OffsetFetch, request).await?;
    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!("OffsetFetch for group {} failed", group_id),
        }
        .into());
    }

    let offsets: Vec<CommittedOffset> = response
        .topics
        .into_iter()
        .flat_map(|topic| {
            let name = topic.name.to_string();
            topic.partitions.into_iter().map(move |p| CommittedOffset {
                topic: name.clone(),
                partition: p.partition_index,
                offset: p.committed_offset,
                metadata: p
                    .metadata
                    .as_ref()
                    .filter(|m| !m.is_empty())
                    .map(|m| m.to_string()),
                error_code: p.error_code,
            })
        })
        .collect();

    debug!(
        "Fetched {} committed offsets for group {}",
        offsets.len(),
        group_id
    );
    Ok(offsets)
}

/// Commit offsets for a consumer group as a single OffsetCommit request.
///
/// The commit is made outside any group generation, so the coordinator
/// rejects it while the group has live members. Returns the per-partition
/// error code reported by the coordinator.
pub async fn commit_offsets(
    client: &KafkaClient,
    group_id: &str,
    offsets: &[(TopicPartition, i64)],
) -> Result<Vec<(TopicPartition, i16)>> {
    let mut topics_map: BTreeMap<&str, Vec<(i32, i64)>> = BTreeMap::new();
    for (tp, offset) in offsets {
        topics_map
            .entry(tp.topic.as_str())
            .or_default()
            .push((tp.partition, *offset));
    }

    let topics: Vec<_> = topics_map
        .into_iter()
        .map(|(topic, partitions)| {
            let partition_data: Vec<_> = partitions
                .into_iter()
                .map(|(partition, offset)| {
                    kafka_protocol::messages::offset_commit_request::OffsetCommitRequestPartition::default()
                        .with_partition_index(partition)
                        .with_committed_offset(offset)
                        .with_committed_metadata(Some(StrBytes::from_static_str("")))
                })
                .collect();

            kafka_protocol::messages::offset_commit_request::OffsetCommitRequestTopic::default()
                .with_name(TopicName(StrBytes::from_string(topic.to_string())))
                .with_partitions(partition_data)
        })
        .collect();

    let request = OffsetCommitRequest::default()
        .with_group_id(GroupId(StrBytes::from_string(group_id.to_string())))
        .with_topics(topics);

    let response: OffsetCommitResponse = client.send_request(ApiKey::OffsetCommit, request).await?;

    let mut results = Vec::new();
    for topic in response.topics {
        for partition in topic.partitions {
            if partition.error_code != 0 {
                warn!(
                    "Failed to commit offset for {}:{} - error code {}",
                    topic.name.as_str(), partition.partition_index, partition.error_code
                );
            }
            results.push((
                TopicPartition::new(topic.name.to_string(), partition.partition_index),
                partition.error_code,
            ));
        }
    }

    debug!("Committed {} offsets for group {}", results.len(), group_id);
    Ok(results)
}

/// Delete committed offsets of `partitions` for an empty group.
///
/// A group-level error (unknown group, group still subscribed) is reported
/// against every requested partition.
pub async fn delete_offsets(
    client: &KafkaClient,
    group_id: &str,
    partitions: &[TopicPartition],
) -> Result<Vec<(TopicPartition, i16)>> {
    let mut by_topic: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for tp in partitions {
        by_topic.entry(tp.topic.as_str()).or_default().push(tp.partition);
    }

    let request = OffsetDeleteRequest::default()
        .with_group_id(GroupId(StrBytes::from_string(group_id.to_string())))
        .with_topics(
            by_topic
                .into_iter()
                .map(|(topic, indexes)| {
                    OffsetDeleteRequestTopic::default()
                        .with_name(TopicName(StrBytes::from_string(topic.to_string())))
                        .with_partitions(
                            indexes
                                .into_iter()
                                .map(|p| OffsetDeleteRequestPartition::default().with_partition_index(p))
                                .collect(),
                        )
                })
                .collect(),
        );

    let response: OffsetDeleteResponse = client.send_request(ApiKey::OffsetDelete, request).await?;

    if response.error_code != 0 {
        warn!(
            "OffsetDelete for group {} rejected with error code {}",
            group_id, response.error_code
        );
        return Ok(partitions
            .iter()
            .map(|tp| (tp.clone(), response.error_code))
            .collect());
    }

    let results: Vec<(TopicPartition, i16)> = response
        .topics
        .iter()
        .flat_map(|topic| {
            topic.partitions.iter().map(move |p| {
                (
                    TopicPartition::new(topic.name.to_string(), p.partition_index),
                    p.error_code,
                )
            })
        })
        .collect();

    debug!("Deleted {} offsets for group {}", results.len(), group_id);
    Ok(results)
}

const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

/// Decode the topic list from a ConsumerProtocolSubscription.
pub(crate) fn parse_member_subscription(bytes: &[u8]) -> Vec<String> {
    decode_subscription(&mut &bytes[..]).unwrap_or_else(|| {
        if !bytes.is_empty() {
            warn!("Could not decode consumer subscription ({} bytes)", bytes.len());
        }
        Vec::new()
    })
}

/// Decode a ConsumerProtocolAssignment into sorted topic partitions.
pub(crate) fn parse_member_assignment(bytes: &[u8]) -> Vec<TopicPartition> {
    decode_assignment(&mut &bytes[..]).unwrap_or_else(|| {
        if !bytes.is_empty() {
            warn!("Could not decode consumer assignment ({} bytes)", bytes.len());
        }
        Vec::new()
    })
}

// version i16, topics [string], user data, then version-specific trailing
// fields that are not needed here.
fn decode_subscription(buf: &mut &[u8]) -> Option<Vec<String>> {
    read_i16(buf)?;
    let count = read_array_len(buf)?;
    let mut topics = Vec::with_capacity(count);
    for _ in 0..count {
        topics.push(read_string(buf)?);
    }
    Some(topics)
}

// version i16, [topic string, [partition i32]], user data
fn decode_assignment(buf: &mut &[u8]) -> Option<Vec<TopicPartition>> {
    read_i16(buf)?;
    let topic_count = read_array_len(buf)?;
    let mut assignment = Vec::new();
    for _ in 0..topic_count {
        let topic = read_string(buf)?;
        let partition_count = read_array_len(buf)?;
        for _ in 0..partition_count {
            if buf.remaining() < 4 {
                return None;
            }
            assignment.push(TopicPartition::new(topic.clone(), buf.get_i32()));
        }
    }
    assignment.sort();
    Some(assignment)
}

fn read_i16(buf: &mut &[u8]) -> Option<i16> {
    (buf.remaining() >= 2).then(|| buf.get_i16())
}

/// Array length; null (-1) reads as empty.
fn read_array_len(buf: &mut &[u8]) -> Option<usize> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_i32();
    if len < 0 {
        return Some(0);
    }
    // Each element needs at least two bytes
    (len as usize <= buf.remaining() / 2 + 1).then_some(len as usize)
}

fn read_string(buf: &mut &[u8]) -> Option<String> {
    let len = read_i16(buf)?;
    if len < 0 || buf.remaining() < len as usize {
        return None;
    }
    let (head, tail) = buf.split_at(len as usize);
    let value = String::from_utf8(head.to_vec()).ok()?;
    *buf = tail;
    Some(value)
}
