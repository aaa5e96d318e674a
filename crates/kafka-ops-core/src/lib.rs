//! Kafka Ops Core Library
//!
//! This crate provides consumer group offset management (plan, validate and
//! apply offset resets, group lag) and a topic-to-topic message pipe with
//! optional Avro re-encoding against a schema registry.

pub mod cluster;
pub mod config;
pub mod error;
pub mod kafka;
pub mod offsets;
pub mod pipe;
pub mod retry;
pub mod schema_registry;
pub mod shutdown;
pub mod types;

pub use cluster::{
    ClusterMetadata, FetchedBatch, KafkaCluster, OffsetCommitter, RecordSink, RecordSource,
};
pub use config::{
    Config, ConnectionConfig, ContextConfig, KafkaConfig, PipeOptions, SchemaRegistryConfig,
    SecurityConfig,
};
pub use error::{Error, KafkaError, Result, RollbackOutcome};
pub use offsets::{
    apply_plan, build_plan, describe_group_lag, render_plan, validate_plan, ApplyReport,
    GroupLagReport, OffsetApplier, OffsetPlan, OffsetPlanBuilder, OffsetPlanValidator,
    OffsetResetStrategy, PlanFormat, PlanTarget, PlanWarning, ValidatedPlan,
};
pub use pipe::{run_pipe, AvroCodec, MessagePipe, PipeConfig, PipeReport, RecordCodec};
pub use retry::{RetryPolicy, RetrySettings};
pub use schema_registry::{SchemaRegistry, SchemaRegistryClient};
pub use shutdown::Shutdown;
pub use types::{
    ConsumerGroupOffset, GroupDescription, GroupMember, GroupState, PipeRecord, RecordHeader,
    TopicPartition, Watermark,
};
