//! Test helper utilities.
//!
//! Cluster fixtures, Avro payload builders and a codec with scripted
//! failures, shared by the offset and pipe tests.

use apache_avro::types::Value;
use apache_avro::Schema;
use async_trait::async_trait;
use bytes::Bytes;
use kafka_ops_core::cluster::memory::InMemoryCluster;
use kafka_ops_core::pipe::{write_wire_format, CodecError, DecodedPayload, RecordCodec};
use kafka_ops_core::schema_registry::StaticSchemaRegistry;
use kafka_ops_core::{GroupDescription, GroupMember, GroupState, TopicPartition};
use std::sync::Arc;

/// Base timestamp for generated records (2023-01-01T00:00:00Z)
pub const BASE_TIMESTAMP: i64 = 1_672_531_200_000;

pub const USER_SCHEMA_ID: u32 = 1;

pub const USER_SCHEMA: &str = r#"{
    "type": "record",
    "name": "User",
    "fields": [{"name": "name", "type": "string"}]
}"#;

pub fn tp(topic: &str, partition: i32) -> TopicPartition {
    TopicPartition::new(topic, partition)
}

/// A cluster holding `topic` with `records` records in every partition.
pub fn cluster_with_topic(topic: &str, partitions: usize, records: usize) -> Arc<InMemoryCluster> {
    let cluster = InMemoryCluster::new().with_topic(topic, partitions);
    for p in 0..partitions as i32 {
        cluster
            .append_values(&tp(topic, p), "v", records, BASE_TIMESTAMP)
            .expect("append to fresh topic");
    }
    Arc::new(cluster)
}

/// A group with one live member assigned `assignment`.
pub fn active_group(group_id: &str, assignment: Vec<TopicPartition>) -> GroupDescription {
    let subscriptions = assignment.iter().map(|tp| tp.topic.clone()).collect();
    GroupDescription {
        group_id: group_id.to_string(),
        state: GroupState::Stable,
        protocol_type: "consumer".to_string(),
        members: vec![GroupMember {
            member_id: "consumer-1-abc".to_string(),
            client_id: "consumer-1".to_string(),
            client_host: "/10.0.0.1".to_string(),
            subscriptions,
            assignment,
        }],
    }
}

/// Registry with `USER_SCHEMA` registered as id 1 under subject "users-value".
pub fn user_registry() -> (Arc<StaticSchemaRegistry>, Arc<Schema>) {
    let registry = StaticSchemaRegistry::new();
    let schema = registry
        .register("users-value", USER_SCHEMA_ID, USER_SCHEMA)
        .expect("valid schema");
    (Arc::new(registry), schema)
}

/// A Confluent framed `User` record.
pub fn user_payload(schema: &Schema, name: &str) -> Bytes {
    let value = Value::Record(vec![("name".to_string(), Value::String(name.to_string()))]);
    let datum = apache_avro::to_avro_datum(schema, value).expect("encode user");
    write_wire_format(USER_SCHEMA_ID, &datum)
}

/// Passes payloads through untouched unless they start with `bad`, which
/// fail to decode.
pub struct PrefixRejectingCodec;

#[async_trait]
impl RecordCodec for PrefixRejectingCodec {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, CodecError> {
        if payload.starts_with(b"bad") {
            return Err(CodecError::Decode("rejected payload".to_string()));
        }
        Ok(DecodedPayload {
            schema_id: 0,
            value: Value::Bytes(payload.to_vec()),
        })
    }

    async fn encode(&self, payload: &DecodedPayload) -> Result<Bytes, CodecError> {
        match &payload.value {
            Value::Bytes(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            other => Err(CodecError::Encode(format!("unexpected value {:?}", other))),
        }
    }

    fn needs_reencode(&self, _payload: &DecodedPayload) -> bool {
        false
    }
}

/// Values copied into `partition`, in offset order.
pub fn values(cluster: &InMemoryCluster, partition: &TopicPartition) -> Vec<String> {
    cluster
        .records(partition)
        .into_iter()
        .map(|r| {
            r.value
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .unwrap_or_default()
        })
        .collect()
}
