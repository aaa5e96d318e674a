//! Kafka protocol client implementation.

mod client;
pub mod consumer_groups;
mod fetch;
mod metadata;
mod partition_router;
mod produce;
pub mod tls;

pub use client::KafkaClient;
pub use consumer_groups::{
    commit_offsets, delete_offsets, describe_groups, fetch_offsets, find_coordinator, list_groups,
    CommittedOffset, ConsumerGroup, ConsumerGroupDescription, Coordinator,
};
pub use fetch::{offset_for_timestamp, FetchResponse};
pub use metadata::{BrokerMetadata, ClusterSnapshot, PartitionMetadata, TopicMetadata};
pub use partition_router::PartitionLeaderRouter;
pub use produce::ProduceResponse;
