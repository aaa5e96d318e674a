//! Kafka Fetch API implementation.

use bytes::Bytes;
use std::collections::HashSet;
use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse as KafkaFetchResponse, ListOffsetsRequest,
    ListOffsetsResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{Record, RecordBatchDecoder};
use tracing::{debug, trace};

use super::KafkaClient;
use crate::error::{codes, KafkaError};
use crate::types::{PipeRecord, RecordHeader, TopicPartition};
use crate::Result;

const EARLIEST_TIMESTAMP: i64 = -2;
const LATEST_TIMESTAMP: i64 = -1;

/// READ_COMMITTED: only committed transactional data, up to the last stable offset
const READ_COMMITTED: i8 = 1;

/// Records and watermarks from one fetch of a single partition
#[derive(Debug, Default)]
pub struct FetchResponse {
    /// Committed data records at or after the requested offset
    pub records: Vec<PipeRecord>,
    /// One past the last offset the response covered, counting transaction
    /// markers and aborted records. `None` when the response held nothing
    /// at or after the requested offset.
    pub next_offset: Option<i64>,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
}

/// Fetch committed records from a topic/partition.
pub async fn fetch(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    offset: i64,
    max_bytes: i32,
) -> Result<FetchResponse> {
    let request = FetchRequest::default()
        .with_replica_id(BrokerId(-1))
        .with_max_wait_ms(500)
        .with_min_bytes(1)
        .with_max_bytes(max_bytes)
        .with_isolation_level(READ_COMMITTED)
        .with_topics(vec![FetchTopic::default()
            .with_topic(TopicName(StrBytes::from_string(topic.to_string())))
            .with_partitions(vec![FetchPartition::default()
                .with_partition(partition)
                .with_fetch_offset(offset)
                .with_partition_max_bytes(max_bytes)
                .with_log_start_offset(-1)])]);

    let response: KafkaFetchResponse = client.send_request(ApiKey::Fetch, request).await?;

    let result = response
        .responses
        .iter()
        .filter(|t| t.topic.as_str() == topic)
        .flat_map(|t| t.partitions.iter())
        .find(|p| p.partition_index == partition)
        .ok_or_else(|| {
            KafkaError::Protocol(format!("No fetch result for {}:{}", topic, partition))
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
                message: format!("Fetch from {}:{} at offset {} failed", topic, partition, offset),
            }
            .into())
        }
    }

    let source = TopicPartition::new(topic, partition);
    let aborted: Vec<(i64, i64)> = result
        .aborted_transactions
        .iter()
        .flatten()
        .map(|txn| (txn.producer_id.0, txn.first_offset))
        .collect();

    let mut records = Vec::new();
    let mut next_offset = None;
    if let Some(data) = result.records.as_ref().filter(|d| !d.is_empty()) {
        let decoded = decode_records(data)?;
        // A batch may start before the requested offset
        next_offset = decoded
            .iter()
            .map(|r| r.offset + 1)
            .filter(|next| *next > offset)
            .max();
        records = committed_records(decoded, aborted)
            .into_iter()
            .filter(|r| r.offset >= offset)
            .map(|r| convert_record(&source, r))
            .collect();
    }

    trace!(
        "Fetched {} records from {} starting at offset {} (next {:?})",
        records.len(),
        source,
        offset,
        next_offset
    );

    Ok(FetchResponse {
        records,
        next_offset,
        high_watermark: result.high_watermark,
        last_stable_offset: result.last_stable_offset,
        log_start_offset: result.log_start_offset,
    })
}

/// Decode every record batch in a fetch payload
fn decode_records(data: &Bytes) -> Result<Vec<Record>> {
    let mut buf = data.clone();
    let sets = RecordBatchDecoder::decode_all(&mut buf)
        .map_err(|e| KafkaError::Protocol(format!("Failed to decode records: {:?}", e)))?;
    Ok(sets.into_iter().flat_map(|set| set.records).collect())
}

/// Drop transaction markers and the records of aborted transactions.
///
/// `aborted` holds (producer id, first offset) for every aborted
/// transaction the broker reported in the fetched range. An aborted
/// transaction covers its producer's records from the first offset up to
/// that producer's next marker.
fn committed_records(records: Vec<Record>, mut aborted: Vec<(i64, i64)>) -> Vec<Record> {
    aborted.sort_by_key(|(_, first_offset)| *first_offset);
    let mut starts = aborted.into_iter().peekable();
    let mut open: HashSet<i64> = HashSet::new();

    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        while let Some((producer_id, _)) = starts.next_if(|(_, first)| *first <= record.offset) {
            open.insert(producer_id);
        }
        if record.control {
            open.remove(&record.producer_id);
            continue;
        }
        if record.transactional && open.contains(&record.producer_id) {
            continue;
        }
        kept.push(record);
    }
    kept
}

fn convert_record(source: &TopicPartition, record: Record) -> PipeRecord {
    let headers = record
        .headers
        .into_iter()
        .map(|(key, value)| RecordHeader {
            key: key.to_string(),
            value,
        })
        .collect();

    PipeRecord {
        source: source.clone(),
        offset: record.offset,
        key: record.key,
        value: record.value,
        timestamp: record.timestamp,
        headers,
    }
}

/// Get the earliest and latest offsets for a partition
pub async fn get_offsets(client: &KafkaClient, topic: &str, partition: i32) -> Result<(i64, i64)> {
    let earliest = list_offset(client, topic, partition, EARLIEST_TIMESTAMP).await?;
    let latest = list_offset(client, topic, partition, LATEST_TIMESTAMP).await?;

    debug!(
        "Offsets for {}:{}: earliest={}, latest={}",
        topic, partition, earliest, latest
    );

    Ok((earliest, latest))
}

/// Earliest offset whose record timestamp is at or after `timestamp_ms`,
/// or `None` when every record is older.
pub async fn offset_for_timestamp(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    timestamp_ms: i64,
) -> Result<Option<i64>> {
    let offset = list_offset(client, topic, partition, timestamp_ms).await?;
    trace!(
        "Offset for {}:{} at timestamp {}: {}",
        topic,
        partition,
        timestamp_ms,
        offset
    );
    Ok((offset >= 0).then_some(offset))
}

/// List offset for a specific timestamp
async fn list_offset(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    timestamp: i64,
) -> Result<i64> {
    let request = ListOffsetsRequest::default()
        .with_replica_id(BrokerId(-1))
        .with_isolation_level(0)
        .with_topics(vec![ListOffsetsTopic::default()
            .with_name(TopicName(StrBytes::from_string(topic.to_string())))
            .with_partitions(vec![ListOffsetsPartition::default()
                .with_partition_index(partition)
                .with_timestamp(timestamp)])]);

    let response: ListOffsetsResponse = client.send_request(ApiKey::ListOffsets, request).await?;

    let result = response
        .topics
        .iter()
        .filter(|t| t.name.as_str() == topic)
        .flat_map(|t| t.partitions.iter())
        .find(|p| p.partition_index == partition)
        .ok_or_else(|| KafkaError::PartitionNotAvailable {
            topic: topic.to_string(),
            partition,
        })?;

    match result.error_code {
        codes::NONE => Ok(result.offset),
        codes::UNKNOWN_TOPIC_OR_PARTITION => Err(crate::Error::PartitionNotFound(
            TopicPartition::new(topic, partition),
        )),
        code => Err(KafkaError::BrokerError {
            code,
            message: format!("ListOffsets for {}:{} failed", topic, partition),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use indexmap::IndexMap;
    use kafka_protocol::protocol::StrBytes;
    use kafka_protocol::records::{
        Compression, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
        NO_PARTITION_LEADER_EPOCH, NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE,
    };

    fn record(offset: i64, value: &'static str) -> Record {
        let mut headers = IndexMap::new();
        headers.insert(
            StrBytes::from_static_str("trace-id"),
            Some(Bytes::from_static(b"abc")),
        );
        Record {
            transactional: false,
            control: false,
            partition_leader_epoch: NO_PARTITION_LEADER_EPOCH,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            timestamp_type: TimestampType::Creation,
            offset,
            sequence: NO_SEQUENCE,
            timestamp: 1_700_000_000_000 + offset,
            key: None,
            value: Some(Bytes::from_static(value.as_bytes())),
            headers,
        }
    }

    #[test]
    fn test_decode_and_convert_batch() {
        let records = vec![record(10, "a"), record(11, "b")];
        let mut buf = BytesMut::new();
        RecordBatchEncoder::encode(
            &mut buf,
            records.iter(),
            &RecordEncodeOptions {
                version: 2,
                compression: Compression::None,
            },
        )
        .unwrap();

        let decoded = decode_records(&buf.freeze()).unwrap();
        assert_eq!(decoded.len(), 2);

        let source = TopicPartition::new("orders", 3);
        let converted: Vec<_> = decoded
            .into_iter()
            .map(|r| convert_record(&source, r))
            .collect();
        assert_eq!(converted[0].source, source);
        assert_eq!(converted[0].offset, 10);
        assert_eq!(converted[1].value.as_deref(), Some(&b"b"[..]));
        assert_eq!(converted[1].timestamp, 1_700_000_000_011);
        assert_eq!(converted[0].headers[0].key, "trace-id");
        assert_eq!(
            converted[0].headers[0].value.as_deref(),
            Some(&b"abc"[..])
        );
    }

    fn txn_record(offset: i64, producer_id: i64, control: bool) -> Record {
        let mut record = record(offset, "txn");
        record.transactional = true;
        record.control = control;
        record.producer_id = producer_id;
        record
    }

    #[test]
    fn test_aborted_transactions_and_markers_are_dropped() {
        let records = vec![
            txn_record(0, 7, false),
            txn_record(1, 7, false),
            txn_record(2, 7, true),
            txn_record(3, 8, false),
            txn_record(4, 8, true),
            record(5, "plain"),
            txn_record(6, 7, false),
        ];

        let kept: Vec<i64> = committed_records(records, vec![(7, 0)])
            .iter()
            .map(|r| r.offset)
            .collect();

        // producer 7's second transaction was not reported aborted
        assert_eq!(kept, vec![3, 5, 6]);
    }
}
