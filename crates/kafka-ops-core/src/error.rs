//! Error types for the kafka-ops core library.

use thiserror::Error;

use crate::types::TopicPartition;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the kafka-ops library.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka protocol error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// The group has no recorded offsets and no partitions were named
    #[error("Consumer group '{group}' has no committed offsets and no partitions were specified")]
    UnknownGroup { group: String },

    /// Topic not found
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// A planned or piped partition does not exist on the cluster
    #[error("Partition not found: {0}")]
    PartitionNotFound(TopicPartition),

    /// Destination topic cannot hold every source partition index
    #[error(
        "Destination topic '{destination}' has {destination_partitions} partitions, \
         source topic '{source_topic}' needs at least {required}"
    )]
    PartitionCountMismatch {
        source_topic: String,
        destination: String,
        required: usize,
        destination_partitions: usize,
    },

    /// The group is active or its generation moved under us
    #[error("Concurrent rebalance on group '{group}': {reason}")]
    ConcurrentRebalance { group: String, reason: String },

    /// Part of a batched commit was rejected; the partitions that did
    /// commit were rolled back, so the group is unchanged
    #[error(
        "Commit for group '{group}' rejected for {} partitions; nothing was changed",
        .rejected.len()
    )]
    CommitRejected {
        group: String,
        rejected: Vec<(TopicPartition, i16)>,
    },

    /// Part of a batched commit was rejected and the rollback did not
    /// restore every committed partition
    #[error(
        "Partial commit for group '{group}': {} partitions committed, {} rejected",
        .committed.len(),
        .rejected.len()
    )]
    PartialCommit {
        group: String,
        committed: Vec<TopicPartition>,
        rejected: Vec<(TopicPartition, i16)>,
        rollback: RollbackOutcome,
    },

    /// A payload could not be decoded with the registered schema
    #[error("Failed to decode record at {topic}[{partition}]@{offset}: {message}")]
    SchemaDecodeFailure {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    /// A decoded payload could not be written with the target schema
    #[error("Failed to encode record from {topic}[{partition}]@{offset}: {message}")]
    SchemaEncodeFailure {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    /// Schema registry request failed
    #[error("Schema registry error: {0}")]
    SchemaRegistry(String),

    /// Cluster could not be reached after retrying
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The run was cancelled
    #[error("Cancelled (outcome unknown: {outcome_unknown})")]
    Cancelled { outcome_unknown: bool },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Authentication(String),
}

/// What happened to the partitions that were committed before a partial
/// failure was detected.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RollbackOutcome {
    /// Partitions restored to their pre-apply offset
    pub restored: Vec<TopicPartition>,

    /// Partitions that had no committed offset before apply, whose new
    /// offset was deleted again
    pub deleted: Vec<TopicPartition>,

    /// Partitions that could not be restored or deleted
    pub failed: Vec<(TopicPartition, String)>,
}

impl RollbackOutcome {
    /// True when every committed partition is back where it started.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Kafka-specific errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KafkaError {
    /// Connection failed
    #[error("Failed to connect to broker {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Broker error response
    #[error("Broker returned error code {code}: {message}")]
    BrokerError { code: i16, message: String },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// No available brokers
    #[error("No available brokers")]
    NoBrokersAvailable,

    /// Topic does not exist
    #[error("Topic does not exist: {0}")]
    TopicNotExists(String),

    /// Partition not available
    #[error("Partition {partition} not available for topic {topic}")]
    PartitionNotAvailable { topic: String, partition: i32 },

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Certificate loading error
    #[error("Failed to load certificate from {path}: {message}")]
    CertificateLoad { path: String, message: String },

    /// Private key loading error
    #[error("Failed to load private key from {path}: {message}")]
    PrivateKeyLoad { path: String, message: String },
}

/// Kafka error codes this crate reacts to.
pub mod codes {
    pub const UNKNOWN_SERVER_ERROR: i16 = -1;
    pub const NONE: i16 = 0;
    pub const OFFSET_OUT_OF_RANGE: i16 = 1;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const NETWORK_EXCEPTION: i16 = 13;
    pub const COORDINATOR_LOAD_IN_PROGRESS: i16 = 14;
    pub const COORDINATOR_NOT_AVAILABLE: i16 = 15;
    pub const NOT_COORDINATOR: i16 = 16;
    pub const ILLEGAL_GENERATION: i16 = 22;
    pub const UNKNOWN_MEMBER_ID: i16 = 25;
    pub const REBALANCE_IN_PROGRESS: i16 = 27;
    pub const GROUP_ID_NOT_FOUND: i16 = 69;
    pub const FENCED_INSTANCE_ID: i16 = 82;
    pub const GROUP_SUBSCRIBED_TO_TOPIC: i16 = 86;
    pub const UNSTABLE_OFFSET_COMMIT: i16 = 88;

    /// Codes that mean the commit lost a race with the group itself.
    pub fn is_group_conflict(code: i16) -> bool {
        matches!(
            code,
            REBALANCE_IN_PROGRESS | ILLEGAL_GENERATION | UNKNOWN_MEMBER_ID | FENCED_INSTANCE_ID
        )
    }

    /// Codes worth resending the same request for.
    pub fn is_retriable(code: i16) -> bool {
        matches!(
            code,
            LEADER_NOT_AVAILABLE
                | NOT_LEADER_OR_FOLLOWER
                | REQUEST_TIMED_OUT
                | NETWORK_EXCEPTION
                | COORDINATOR_LOAD_IN_PROGRESS
                | COORDINATOR_NOT_AVAILABLE
                | NOT_COORDINATOR
                | UNSTABLE_OFFSET_COMMIT
        )
    }
}

impl KafkaError {
    /// Whether this failure is about reaching the cluster rather than about
    /// the request itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            KafkaError::ConnectionFailed { .. }
                | KafkaError::NoBrokersAvailable
                | KafkaError::Timeout(_)
        )
    }
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BrokerUnavailable(_) | Error::Io(_) => true,
            Error::Kafka(e) if e.is_connectivity() => true,
            Error::Kafka(KafkaError::BrokerError { code, .. }) => codes::is_retriable(*code),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::SchemaRegistry(err.to_string())
    }
}

impl From<apache_avro::Error> for Error {
    fn from(err: apache_avro::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
