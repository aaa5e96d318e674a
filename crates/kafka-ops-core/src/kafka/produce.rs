//! Kafka Produce API implementation.

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::{
    ApiKey, ProduceRequest, ProduceResponse as KafkaProduceResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
    NO_PARTITION_LEADER_EPOCH, NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE,
};
use tracing::trace;

use super::KafkaClient;
use crate::error::{codes, KafkaError};
use crate::types::{PipeRecord, TopicPartition};
use crate::Result;

/// Acknowledged produce of one batch
#[derive(Debug)]
pub struct ProduceResponse {
    /// Offset the broker assigned to the first record
    pub base_offset: i64,
    pub record_count: usize,
}

/// Produce records to a topic/partition as one batch with `acks=all`.
///
/// Source timestamps are kept when `preserve_timestamps` is set, otherwise
/// every record is stamped with the current time.
pub async fn produce(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    records: &[PipeRecord],
    preserve_timestamps: bool,
) -> Result<ProduceResponse> {
    let record_count = records.len();
    if record_count == 0 {
        return Ok(ProduceResponse {
            base_offset: -1,
            record_count,
        });
    }

    let batch = to_batch_records(records, preserve_timestamps);
    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };
    let mut encoded = BytesMut::new();
    RecordBatchEncoder::encode(&mut encoded, batch.iter(), &options)
        .map_err(|e| KafkaError::Protocol(format!("Failed to encode records: {:?}", e)))?;

    let request = ProduceRequest::default()
        .with_acks(-1)
        .with_timeout_ms(client.request_timeout_ms())
        .with_topic_data(vec![TopicProduceData::default()
            .with_name(TopicName(StrBytes::from_string(topic.to_string())))
            .with_partition_data(vec![PartitionProduceData::default()
                .with_index(partition)
                .with_records(Some(encoded.freeze()))])]);

    let response: KafkaProduceResponse = client.send_request(ApiKey::Produce, request).await?;

    let result = response
        .responses
        .iter()
        .filter(|t| t.name.as_str() == topic)
        .flat_map(|t| t.partition_responses.iter())
        .find(|p| p.index == partition)
        .ok_or_else(|| {
            KafkaError::Protocol(format!("No produce result for {}:{}", topic, partition))
        })?;

    match result.error_code {
        codes::NONE => {}
        codes::UNKNOWN_TOPIC_OR_PARTITION => {
            return Err(crate::Error::PartitionNotFound(TopicPartition::new(
                topic, partition,
            )))
        }
        code => {
            return Err(KafkaError::BrokerError {
                code,
                message: format!("Produce to {}:{} rejected", topic, partition),
            }
            .into())
        }
    }

    trace!(
        "Produced {} records to {}:{} at offset {}",
        record_count,
        topic,
        partition,
        result.base_offset
    );
    Ok(ProduceResponse {
        base_offset: result.base_offset,
        record_count,
    })
}

/// Build batch records with relative offsets.
fn to_batch_records(records: &[PipeRecord], preserve_timestamps: bool) -> Vec<Record> {
    let now = chrono::Utc::now().timestamp_millis();
    records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let headers: IndexMap<StrBytes, Option<Bytes>> = r
                .headers
                .iter()
                .map(|h| (StrBytes::from_string(h.key.clone()), h.value.clone()))
                .collect();

            Record {
                transactional: false,
                control: false,
                partition_leader_epoch: NO_PARTITION_LEADER_EPOCH,
                producer_id: NO_PRODUCER_ID,
                producer_epoch: NO_PRODUCER_EPOCH,
                timestamp_type: TimestampType::Creation,
                offset: i as i64,
                sequence: NO_SEQUENCE,
                timestamp: if preserve_timestamps { r.timestamp } else { now },
                key: r.key.clone(),
                value: r.value.clone(),
                headers,
            }
        })
        .collect()
}
