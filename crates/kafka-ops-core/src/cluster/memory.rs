//! In-process cluster for tests and local experiments.
//!
//! Holds topic logs, committed offsets and group descriptions behind a
//! mutex, and lets callers inject the failures a real cluster produces:
//! unreachable brokers, coordinator errors, per-partition commit rejections
//! and slow commits.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ClusterMetadata, FetchedBatch, OffsetCommitter, RecordSink, RecordSource};
use crate::error::{codes, KafkaError};
use crate::types::{
    ConsumerGroupOffset, GroupDescription, GroupState, PipeRecord, TopicPartition, Watermark,
};
use crate::{Error, Result};

/// A failure injected into the next commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFault {
    /// The request never gets an answer
    Transport,
    /// Every partition in the request comes back with this error code
    ErrorCode(i16),
}

#[derive(Debug, Default)]
struct PartitionLog {
    log_start: i64,
    records: Vec<PipeRecord>,
    /// Offsets holding transaction markers rather than data
    markers: BTreeSet<i64>,
}

impl PartitionLog {
    fn high(&self) -> i64 {
        self.log_start + self.records.len() as i64
    }

    fn data(&self) -> impl Iterator<Item = &PipeRecord> {
        self.records
            .iter()
            .filter(move |r| !self.markers.contains(&r.offset))
    }
}

#[derive(Debug, Default)]
struct State {
    topics: BTreeMap<String, Vec<PartitionLog>>,
    offsets: HashMap<String, BTreeMap<TopicPartition, i64>>,
    groups: HashMap<String, GroupDescription>,
    commit_faults: VecDeque<CommitFault>,
    delete_faults: VecDeque<i16>,
    partition_rejections: HashMap<TopicPartition, i16>,
    fetch_faults: HashMap<TopicPartition, usize>,
    unavailable: bool,
    commit_delay: Option<Duration>,
}

/// In-memory implementation of every cluster trait.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    commit_calls: AtomicUsize,
    produce_calls: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty topic with `partitions` partitions.
    pub fn with_topic(self, topic: &str, partitions: usize) -> Self {
        self.create_topic(topic, partitions);
        self
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let logs = (0..partitions).map(|_| PartitionLog::default()).collect();
        self.state.lock().topics.insert(topic.to_string(), logs);
    }

    /// Append a record and return its offset.
    pub fn append(
        &self,
        tp: &TopicPartition,
        key: Option<Bytes>,
        value: Option<Bytes>,
        timestamp: i64,
    ) -> Result<i64> {
        let mut state = self.state.lock();
        let log = partition_log_mut(&mut state.topics, tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
        let offset = log.high();
        log.records.push(PipeRecord {
            source: tp.clone(),
            offset,
            key,
            value,
            timestamp,
            headers: Vec::new(),
        });
        Ok(offset)
    }

    /// Append `count` records whose values are `"<prefix>-<offset>"`, with
    /// timestamps `base_timestamp + offset`.
    pub fn append_values(
        &self,
        tp: &TopicPartition,
        prefix: &str,
        count: usize,
        base_timestamp: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let log = partition_log_mut(&mut state.topics, tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
        for _ in 0..count {
            let offset = log.high();
            log.records.push(PipeRecord {
                source: tp.clone(),
                offset,
                key: None,
                value: Some(Bytes::from(format!("{}-{}", prefix, offset))),
                timestamp: base_timestamp + offset,
                headers: Vec::new(),
            });
        }
        Ok(())
    }

    /// Append a transaction marker. It takes up an offset but is never
    /// returned as a record.
    pub fn append_marker(&self, tp: &TopicPartition) -> Result<i64> {
        let mut state = self.state.lock();
        let log = partition_log_mut(&mut state.topics, tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
        let offset = log.high();
        log.records.push(PipeRecord {
            source: tp.clone(),
            offset,
            key: None,
            value: None,
            timestamp: 0,
            headers: Vec::new(),
        });
        log.markers.insert(offset);
        Ok(offset)
    }

    /// Drop every record below `offset`, as retention would.
    pub fn truncate_before(&self, tp: &TopicPartition, offset: i64) {
        let mut state = self.state.lock();
        if let Some(log) = partition_log_mut(&mut state.topics, tp) {
            let drop = (offset - log.log_start).clamp(0, log.records.len() as i64) as usize;
            log.records.drain(..drop);
            log.log_start += drop as i64;
            let log_start = log.log_start;
            log.markers.retain(|m| *m >= log_start);
        }
    }

    /// Data records currently in a partition.
    pub fn records(&self, tp: &TopicPartition) -> Vec<PipeRecord> {
        let state = self.state.lock();
        partition_log(&state.topics, tp)
            .map(|log| log.data().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_committed(&self, group_id: &str, tp: &TopicPartition, offset: i64) {
        self.state
            .lock()
            .offsets
            .entry(group_id.to_string())
            .or_default()
            .insert(tp.clone(), offset);
    }

    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.state
            .lock()
            .offsets
            .get(group_id)
            .and_then(|offsets| offsets.get(tp).copied())
    }

    /// Replace the description returned for a group.
    pub fn set_group(&self, description: GroupDescription) {
        self.state
            .lock()
            .groups
            .insert(description.group_id.clone(), description);
    }

    pub fn fail_next_commit(&self, fault: CommitFault) {
        self.state.lock().commit_faults.push_back(fault);
    }

    /// Fail every partition of the next offset deletion with `code`.
    pub fn fail_next_delete(&self, code: i16) {
        self.state.lock().delete_faults.push_back(code);
    }

    /// Reject `tp` with `code` in the next commit that includes it.
    pub fn reject_partition_on_next_commit(&self, tp: &TopicPartition, code: i16) {
        self.state
            .lock()
            .partition_rejections
            .insert(tp.clone(), code);
    }

    /// Fail the next `times` fetches of `tp` with a connectivity error.
    pub fn fail_fetches(&self, tp: &TopicPartition, times: usize) {
        self.state.lock().fetch_faults.insert(tp.clone(), times);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Delay every commit by `delay` before it takes effect.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.state.lock().commit_delay = Some(delay);
    }

    /// Number of commit requests received, including failed ones.
    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn produce_calls(&self) -> usize {
        self.produce_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.state.lock().unavailable {
            return Err(Error::BrokerUnavailable(
                "in-memory cluster is unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn partition_log<'a>(
    topics: &'a BTreeMap<String, Vec<PartitionLog>>,
    tp: &TopicPartition,
) -> Option<&'a PartitionLog> {
    usize::try_from(tp.partition)
        .ok()
        .and_then(|p| topics.get(&tp.topic)?.get(p))
}

fn partition_log_mut<'a>(
    topics: &'a mut BTreeMap<String, Vec<PartitionLog>>,
    tp: &TopicPartition,
) -> Option<&'a mut PartitionLog> {
    usize::try_from(tp.partition)
        .ok()
        .and_then(|p| topics.get_mut(&tp.topic)?.get_mut(p))
}

fn record_size(record: &PipeRecord) -> usize {
    record.key.as_ref().map_or(0, |k| k.len()) + record.value.as_ref().map_or(0, |v| v.len())
}

#[async_trait]
impl ClusterMetadata for InMemoryCluster {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<TopicPartition>> {
        self.check_available()?;
        let state = self.state.lock();
        let logs = state
            .topics
            .get(topic)
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
        Ok((0..logs.len() as i32)
            .map(|p| TopicPartition::new(topic, p))
            .collect())
    }

    async fn watermarks(&self, tp: &TopicPartition) -> Result<Watermark> {
        self.check_available()?;
        let state = self.state.lock();
        let log = partition_log(&state.topics, tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
        Ok(Watermark::new(log.log_start, log.high()))
    }

    async fn committed_offsets(&self, group_id: &str) -> Result<Vec<ConsumerGroupOffset>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .offsets
            .get(group_id)
            .map(|offsets| {
                offsets
                    .iter()
                    .map(|(tp, offset)| ConsumerGroupOffset {
                        group_id: group_id.to_string(),
                        topic_partition: tp.clone(),
                        offset: *offset,
                        metadata: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe_group(&self, group_id: &str) -> Result<GroupDescription> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .groups
            .get(group_id)
            .cloned()
            .unwrap_or_else(|| GroupDescription::empty(group_id)))
    }

    async fn offset_for_timestamp(
        &self,
        tp: &TopicPartition,
        timestamp_ms: i64,
    ) -> Result<Option<i64>> {
        self.check_available()?;
        let state = self.state.lock();
        let log = partition_log(&state.topics, tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
        let offset = log
            .data()
            .find(|r| r.timestamp >= timestamp_ms)
            .map(|r| r.offset);
        Ok(offset)
    }

    async fn list_groups(&self) -> Result<Vec<String>> {
        self.check_available()?;
        let state = self.state.lock();
        let groups: BTreeSet<String> = state
            .offsets
            .keys()
            .chain(state.groups.keys())
            .cloned()
            .collect();
        Ok(groups.into_iter().collect())
    }
}

#[async_trait]
impl OffsetCommitter for InMemoryCluster {
    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: &[(TopicPartition, i64)],
    ) -> Result<Vec<(TopicPartition, i16)>> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let delay = self.state.lock().commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        match state.commit_faults.pop_front() {
            Some(CommitFault::Transport) => {
                return Err(KafkaError::ConnectionFailed {
                    broker: "in-memory".to_string(),
                    message: "injected transport failure".to_string(),
                }
                .into())
            }
            Some(CommitFault::ErrorCode(code)) => {
                return Ok(offsets.iter().map(|(tp, _)| (tp.clone(), code)).collect())
            }
            None => {}
        }

        let group_code = state.groups.get(group_id).and_then(|g| {
            if g.state.is_rebalancing() {
                Some(codes::REBALANCE_IN_PROGRESS)
            } else if !g.members.is_empty() && g.state != GroupState::Empty {
                Some(codes::UNKNOWN_MEMBER_ID)
            } else {
                None
            }
        });
        if let Some(code) = group_code {
            return Ok(offsets.iter().map(|(tp, _)| (tp.clone(), code)).collect());
        }

        let mut results = Vec::with_capacity(offsets.len());
        for (tp, offset) in offsets {
            let code = if let Some(code) = state.partition_rejections.remove(tp) {
                code
            } else if partition_log(&state.topics, tp).is_none() {
                codes::UNKNOWN_TOPIC_OR_PARTITION
            } else {
                state
                    .offsets
                    .entry(group_id.to_string())
                    .or_default()
                    .insert(tp.clone(), *offset);
                codes::NONE
            };
            results.push((tp.clone(), code));
        }
        Ok(results)
    }

    async fn delete_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, i16)>> {
        self.check_available()?;
        let mut state = self.state.lock();

        let group_code = state.delete_faults.pop_front().or_else(|| {
            state
                .groups
                .get(group_id)
                .filter(|g| !g.members.is_empty() && g.state != GroupState::Empty)
                .map(|_| codes::GROUP_SUBSCRIBED_TO_TOPIC)
        });
        if let Some(code) = group_code {
            return Ok(partitions.iter().map(|tp| (tp.clone(), code)).collect());
        }

        let offsets = state.offsets.entry(group_id.to_string()).or_default();
        for tp in partitions {
            offsets.remove(tp);
        }
        Ok(partitions.iter().map(|tp| (tp.clone(), codes::NONE)).collect())
    }
}

#[async_trait]
impl RecordSource for InMemoryCluster {
    async fn fetch(
        &self,
        tp: &TopicPartition,
        offset: i64,
        max_bytes: i32,
    ) -> Result<FetchedBatch> {
        self.check_available()?;
        let mut state = self.state.lock();

        if let Some(remaining) = state.fetch_faults.get_mut(tp) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::BrokerUnavailable(format!(
                    "injected fetch failure for {}",
                    tp
                )));
            }
        }

        let log = partition_log(&state.topics, tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
        if offset < log.log_start || offset > log.high() {
            return Err(KafkaError::BrokerError {
                code: codes::OFFSET_OUT_OF_RANGE,
                message: format!("offset {} out of range for {}", offset, tp),
            }
            .into());
        }

        // Every entry is its own batch; the first is returned whatever its size
        let budget = max_bytes.max(0) as usize;
        let mut used = 0usize;
        let mut records = Vec::new();
        let mut next_offset = None;
        for record in &log.records[(offset - log.log_start) as usize..] {
            let size = record_size(record);
            if next_offset.is_some() && used + size > budget {
                break;
            }
            used += size;
            next_offset = Some(record.offset + 1);
            if !log.markers.contains(&record.offset) {
                records.push(record.clone());
            }
        }

        Ok(FetchedBatch {
            records,
            next_offset,
            high_watermark: log.high(),
            log_start_offset: log.log_start,
        })
    }
}

#[async_trait]
impl RecordSink for InMemoryCluster {
    async fn produce(
        &self,
        tp: &TopicPartition,
        records: &[PipeRecord],
        preserve_timestamps: bool,
    ) -> Result<i64> {
        self.produce_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut state = self.state.lock();
        let log = partition_log_mut(&mut state.topics, tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
        let base_offset = log.high();
        for (i, record) in records.iter().enumerate() {
            log.records.push(PipeRecord {
                source: tp.clone(),
                offset: base_offset + i as i64,
                key: record.key.clone(),
                value: record.value.clone(),
                timestamp: if preserve_timestamps {
                    record.timestamp
                } else {
                    now
                },
                headers: record.headers.clone(),
            });
        }
        Ok(base_offset)
    }
}
