//! Value types shared by the offset engine and the message pipe.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single partition of a topic. Orders by topic, then partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Parses `topic:partition`. The topic may itself contain colons; the last
/// one separates the partition.
impl FromStr for TopicPartition {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (topic, partition) = s.rsplit_once(':').ok_or_else(|| {
            crate::Error::Config(format!("Expected 'topic:partition', got '{}'", s))
        })?;
        if topic.is_empty() {
            return Err(crate::Error::Config(format!("Missing topic in '{}'", s)));
        }
        let partition: i32 = partition
            .parse()
            .map_err(|_| crate::Error::Config(format!("Invalid partition in '{}'", s)))?;
        if partition < 0 {
            return Err(crate::Error::Config(format!(
                "Partition must be >= 0 in '{}'",
                s
            )));
        }
        Ok(Self::new(topic, partition))
    }
}

/// Live offset bounds of a partition. `high` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub low: i64,
    pub high: i64,
}

impl Watermark {
    pub fn new(low: i64, high: i64) -> Self {
        Self { low, high }
    }

    /// Number of records currently retained.
    pub fn len(&self) -> i64 {
        self.high - self.low
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    pub fn contains(&self, offset: i64) -> bool {
        offset >= self.low && offset <= self.high
    }
}

/// Committed offset of one group on one partition. `-1` means none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroupOffset {
    pub group_id: String,
    pub topic_partition: TopicPartition,
    pub offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl ConsumerGroupOffset {
    pub fn has_offset(&self) -> bool {
        self.offset >= 0
    }
}

/// Record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

/// A record in transit through the message pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeRecord {
    pub source: TopicPartition,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: i64,
    pub headers: Vec<RecordHeader>,
}

/// Group coordinator state as reported by DescribeGroups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupState {
    Empty,
    Stable,
    PreparingRebalance,
    CompletingRebalance,
    Dead,
    Unknown(String),
}

impl GroupState {
    pub fn parse(state: &str) -> Self {
        match state {
            "Empty" => GroupState::Empty,
            "Stable" => GroupState::Stable,
            "PreparingRebalance" => GroupState::PreparingRebalance,
            "CompletingRebalance" | "AwaitingSync" => GroupState::CompletingRebalance,
            "Dead" => GroupState::Dead,
            other => GroupState::Unknown(other.to_string()),
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        matches!(
            self,
            GroupState::PreparingRebalance | GroupState::CompletingRebalance
        )
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Empty => write!(f, "Empty"),
            GroupState::Stable => write!(f, "Stable"),
            GroupState::PreparingRebalance => write!(f, "PreparingRebalance"),
            GroupState::CompletingRebalance => write!(f, "CompletingRebalance"),
            GroupState::Dead => write!(f, "Dead"),
            GroupState::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// A live member of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    /// Topics from the member's subscription metadata
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Partitions currently assigned to the member
    #[serde(default)]
    pub assignment: Vec<TopicPartition>,
}

/// Result of DescribeGroups for a single group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub group_id: String,
    pub state: GroupState,
    pub protocol_type: String,
    pub members: Vec<GroupMember>,
}

impl GroupDescription {
    /// Description of a group the coordinator knows nothing about.
    pub fn empty(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            state: GroupState::Empty,
            protocol_type: String::new(),
            members: Vec::new(),
        }
    }

    /// A group with members or a rebalance underway must not have its
    /// offsets rewritten.
    pub fn is_active(&self) -> bool {
        !self.members.is_empty() || self.state.is_rebalancing()
    }

    /// Topics the live members subscribe to or are assigned.
    pub fn subscribed_topics(&self) -> std::collections::BTreeSet<String> {
        self.members
            .iter()
            .flat_map(|m| {
                m.subscriptions
                    .iter()
                    .cloned()
                    .chain(m.assignment.iter().map(|tp| tp.topic.clone()))
            })
            .collect()
    }

    /// Every partition assigned to some member.
    pub fn assigned_partitions(&self) -> std::collections::BTreeSet<TopicPartition> {
        self.members
            .iter()
            .flat_map(|m| m.assignment.iter().cloned())
            .collect()
    }
}
