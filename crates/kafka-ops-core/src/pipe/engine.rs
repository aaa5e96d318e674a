//! Topic-to-topic copy engine.
//!
//! Every source partition is copied by its own task into the destination
//! partition with the same index. A worker fetches, transforms and writes
//! one batch at a time and only fetches again once the previous batch has
//! been acknowledged, so records never reorder within a partition.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::codec::RecordCodec;
use super::report::{
    FailureKind, OffsetRange, PartitionPipeReport, PartitionStatus, PipeFailure, PipeReport,
};
use crate::cluster::{ClusterMetadata, RecordSink, RecordSource};
use crate::config::PipeOptions;
use crate::error::KafkaError;
use crate::offsets::plan::fetch_watermarks;
use crate::shutdown::Shutdown;
use crate::types::{PipeRecord, TopicPartition, Watermark};
use crate::{Error, Result};

/// What to copy.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub source_topic: String,

    /// Copy only these source partitions
    pub source_partitions: Option<Vec<i32>>,

    pub destination_topic: String,

    /// Explicit offset range per source partition. Partitions without one
    /// copy everything retained when the run starts.
    pub ranges: BTreeMap<i32, OffsetRange>,

    pub options: PipeOptions,
}

impl PipeConfig {
    pub fn new(source_topic: impl Into<String>, destination_topic: impl Into<String>) -> Self {
        Self {
            source_topic: source_topic.into(),
            source_partitions: None,
            destination_topic: destination_topic.into(),
            ranges: BTreeMap::new(),
            options: PipeOptions::default(),
        }
    }

    pub fn with_partitions(mut self, partitions: Vec<i32>) -> Self {
        self.source_partitions = Some(partitions);
        self
    }

    pub fn with_range(mut self, partition: i32, range: OffsetRange) -> Self {
        self.ranges.insert(partition, range);
        self
    }

    pub fn with_options(mut self, options: PipeOptions) -> Self {
        self.options = options;
        self
    }
}

/// Copies records from a source topic to a destination topic, optionally
/// on another cluster.
pub struct MessagePipe<S: ?Sized, D: ?Sized> {
    source: Arc<S>,
    destination: Arc<D>,
    codec: Option<Arc<dyn RecordCodec>>,
    shutdown: Shutdown,
}

impl<S, D> MessagePipe<S, D>
where
    S: ClusterMetadata + RecordSource + ?Sized + 'static,
    D: ClusterMetadata + RecordSink + ?Sized + 'static,
{
    pub fn new(source: Arc<S>, destination: Arc<D>) -> Self {
        Self {
            source,
            destination,
            codec: None,
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn RecordCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the pipe to completion.
    ///
    /// Fails before writing anything when the topics cannot be read or the
    /// destination has too few partitions. Failures after that are reported
    /// per partition and do not stop the other workers.
    pub async fn run(&self, config: &PipeConfig) -> Result<PipeReport> {
        let start = Instant::now();
        config.options.validate()?;

        let partitions = self.source_partitions(config).await?;
        self.check_destination(config, &partitions).await?;

        let tps: Vec<TopicPartition> = partitions
            .iter()
            .map(|p| TopicPartition::new(config.source_topic.clone(), *p))
            .collect();
        let watermarks = fetch_watermarks(self.source.as_ref(), &tps).await?;

        info!(
            "Piping {} partitions from {} to {}",
            tps.len(),
            config.source_topic,
            config.destination_topic
        );

        let semaphore = Arc::new(Semaphore::new(config.options.max_concurrent_partitions));
        let mut handles = Vec::with_capacity(tps.len());

        for tp in tps {
            let watermark = watermarks
                .get(&tp)
                .copied()
                .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;
            let range = resolve_range(
                config.ranges.get(&tp.partition).copied(),
                watermark,
                config.options.tail_count(),
            );

            let worker = PartitionWorker {
                source: Arc::clone(&self.source),
                destination: Arc::clone(&self.destination),
                codec: self.codec.clone(),
                shutdown: self.shutdown.clone(),
                destination_tp: TopicPartition::new(config.destination_topic.clone(), tp.partition),
                source_tp: tp,
                range,
                options: config.options.clone(),
            };

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::Config(format!("Semaphore error: {}", e)))?;
            let partition = worker.source_tp.partition;
            handles.push((
                partition,
                range,
                tokio::spawn(async move {
                    let report = worker.run().await;
                    drop(permit);
                    report
                }),
            ));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (partition, range, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Pipe worker for partition {} panicked: {}", partition, e);
                    let mut report = PartitionPipeReport::new(partition, range);
                    report.status = PartitionStatus::Failed(PipeFailure {
                        kind: FailureKind::Other,
                        offset: None,
                        message: format!("Task join error: {}", e),
                    });
                    report
                }
            };
            reports.push(report);
        }
        reports.sort_by_key(|r| r.partition);

        let report = PipeReport {
            source_topic: config.source_topic.clone(),
            destination_topic: config.destination_topic.clone(),
            total_copied: reports.iter().map(|r| r.records_copied).sum(),
            total_skipped: reports.iter().map(|r| r.records_skipped).sum(),
            partitions: reports,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Pipe {} -> {} copied {} records ({} skipped, {} partitions unfinished)",
            report.source_topic,
            report.destination_topic,
            report.total_copied,
            report.total_skipped,
            report.failed_partitions().len()
        );
        Ok(report)
    }

    async fn source_partitions(&self, config: &PipeConfig) -> Result<Vec<i32>> {
        let available: BTreeSet<i32> = self
            .source
            .list_partitions(&config.source_topic)
            .await?
            .into_iter()
            .map(|tp| tp.partition)
            .collect();

        match &config.source_partitions {
            None => Ok(available.into_iter().collect()),
            Some(requested) => {
                let requested: BTreeSet<i32> = requested.iter().copied().collect();
                if let Some(missing) = requested.iter().find(|p| !available.contains(p)) {
                    return Err(Error::PartitionNotFound(TopicPartition::new(
                        config.source_topic.clone(),
                        *missing,
                    )));
                }
                Ok(requested.into_iter().collect())
            }
        }
    }

    async fn check_destination(&self, config: &PipeConfig, partitions: &[i32]) -> Result<()> {
        let Some(highest) = partitions.iter().max() else {
            return Ok(());
        };
        let required = *highest as usize + 1;
        let destination_partitions = self
            .destination
            .list_partitions(&config.destination_topic)
            .await?
            .len();

        if destination_partitions < required {
            return Err(Error::PartitionCountMismatch {
                source_topic: config.source_topic.clone(),
                destination: config.destination_topic.clone(),
                required,
                destination_partitions,
            });
        }
        Ok(())
    }
}

/// Run `config` from `source` to `destination`.
pub async fn run_pipe<S, D>(
    source: Arc<S>,
    destination: Arc<D>,
    codec: Option<Arc<dyn RecordCodec>>,
    config: &PipeConfig,
    shutdown: Shutdown,
) -> Result<PipeReport>
where
    S: ClusterMetadata + RecordSource + ?Sized + 'static,
    D: ClusterMetadata + RecordSink + ?Sized + 'static,
{
    let mut pipe = MessagePipe::new(source, destination).with_shutdown(shutdown);
    if let Some(codec) = codec {
        pipe = pipe.with_codec(codec);
    }
    pipe.run(config).await
}

/// Clamp an explicit range to what is retained; default to everything.
/// With `tail`, keep only that many offsets at the end of the range.
fn resolve_range(
    requested: Option<OffsetRange>,
    watermark: Watermark,
    tail: Option<u64>,
) -> OffsetRange {
    let range = match requested {
        None => OffsetRange::new(watermark.low, watermark.high),
        Some(range) => {
            let start = range.start.max(watermark.low);
            let end = range.end.min(watermark.high).max(start);
            OffsetRange::new(start, end)
        }
    };
    match tail {
        Some(count) => {
            let count = i64::try_from(count).unwrap_or(i64::MAX);
            OffsetRange::new(range.start.max(range.end.saturating_sub(count)), range.end)
        }
        None => range,
    }
}

struct PartitionWorker<S: ?Sized, D: ?Sized> {
    source: Arc<S>,
    destination: Arc<D>,
    codec: Option<Arc<dyn RecordCodec>>,
    shutdown: Shutdown,
    source_tp: TopicPartition,
    destination_tp: TopicPartition,
    range: OffsetRange,
    options: PipeOptions,
}

impl<S, D> PartitionWorker<S, D>
where
    S: RecordSource + ?Sized,
    D: RecordSink + ?Sized,
{
    async fn run(self) -> PartitionPipeReport {
        let mut report = PartitionPipeReport::new(self.source_tp.partition, self.range);
        debug!(
            "Copying {} offsets {}..{} to {}",
            self.source_tp, self.range.start, self.range.end, self.destination_tp
        );

        match self.copy(&mut report).await {
            Ok(()) => {
                debug!(
                    "Finished {}: {} records copied",
                    self.source_tp, report.records_copied
                );
            }
            Err(Error::Cancelled { .. }) => {
                warn!(
                    "Pipe for {} cancelled at offset {}",
                    self.source_tp, report.next_offset
                );
                report.status = PartitionStatus::Cancelled;
            }
            Err(e) => {
                error!(
                    "Pipe for {} failed at offset {}: {}",
                    self.source_tp, report.next_offset, e
                );
                report.status = PartitionStatus::Failed(PipeFailure::from(&e));
            }
        }
        report
    }

    async fn copy(&self, report: &mut PartitionPipeReport) -> Result<()> {
        let mut pending: Vec<PipeRecord> = Vec::with_capacity(self.options.batch_size);
        let mut next = self.range.start;

        while next < self.range.end && !self.limit_reached(report, pending.len()) {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    return Err(Error::Cancelled { outcome_unknown: false });
                }
                batch = self.source.fetch(&self.source_tp, next, self.options.fetch_max_bytes) => batch?,
            };

            let Some(fetched_to) = batch.next_offset.filter(|n| *n > next) else {
                if next >= batch.high_watermark {
                    debug!(
                        "{} reached high watermark {} at offset {}",
                        self.source_tp, batch.high_watermark, next
                    );
                    break;
                }
                return Err(KafkaError::Protocol(format!(
                    "fetch for {} at offset {} made no progress below high watermark {}",
                    self.source_tp, next, batch.high_watermark
                ))
                .into());
            };

            let mut consumed_all = true;
            for record in batch.records {
                if record.offset >= self.range.end {
                    next = self.range.end;
                    consumed_all = false;
                    break;
                }
                if self.limit_reached(report, pending.len()) {
                    consumed_all = false;
                    break;
                }
                let offset = record.offset;
                match self.transform(record).await {
                    Ok(record) => pending.push(record),
                    Err(e) if self.options.skip_on_error => {
                        warn!("Skipping record: {}", e);
                        report.records_skipped += 1;
                    }
                    Err(e) => {
                        self.flush(&mut pending, report).await?;
                        report.next_offset = offset;
                        return Err(e);
                    }
                }
                next = offset + 1;

                if pending.len() >= self.options.batch_size {
                    self.flush(&mut pending, report).await?;
                    report.next_offset = next;
                }
            }

            if consumed_all {
                // Skip markers and aborted records after the last data record
                next = next.max(fetched_to.min(self.range.end));
            }

            self.flush(&mut pending, report).await?;
            report.next_offset = next;
        }
        Ok(())
    }

    fn limit_reached(&self, report: &PartitionPipeReport, pending: usize) -> bool {
        self.options
            .record_limit
            .is_some_and(|limit| report.records_copied + pending as u64 >= limit)
    }

    /// Write `pending` as one batch and wait for the acknowledgement.
    async fn flush(&self, pending: &mut Vec<PipeRecord>, report: &mut PartitionPipeReport) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let base_offset = tokio::select! {
            biased;
            _ = self.shutdown.wait() => {
                return Err(Error::Cancelled { outcome_unknown: true });
            }
            result = self.destination.produce(
                &self.destination_tp,
                pending.as_slice(),
                self.options.preserve_timestamps,
            ) => result?,
        };
        debug!(
            "Wrote {} records to {} at base offset {}",
            pending.len(),
            self.destination_tp,
            base_offset
        );
        report.records_copied += pending.len() as u64;
        pending.clear();
        Ok(())
    }

    async fn transform(&self, mut record: PipeRecord) -> Result<PipeRecord> {
        if !self.options.keep_headers {
            record.headers.clear();
        }
        let Some(codec) = &self.codec else {
            return Ok(record);
        };

        if let Some(value) = record.value.take() {
            record.value = Some(self.transcode(codec.as_ref(), value, record.offset).await?);
        }
        if self.options.transcode_keys {
            if let Some(key) = record.key.take() {
                record.key = Some(self.transcode(codec.as_ref(), key, record.offset).await?);
            }
        }
        Ok(record)
    }

    async fn transcode(&self, codec: &dyn RecordCodec, payload: Bytes, offset: i64) -> Result<Bytes> {
        let decoded = codec
            .decode(&payload)
            .await
            .map_err(|e| Error::SchemaDecodeFailure {
                topic: self.source_tp.topic.clone(),
                partition: self.source_tp.partition,
                offset,
                message: e.to_string(),
            })?;
        if !codec.needs_reencode(&decoded) {
            return Ok(payload);
        }
        codec
            .encode(&decoded)
            .await
            .map_err(|e| Error::SchemaEncodeFailure {
                topic: self.source_tp.topic.clone(),
                partition: self.source_tp.partition,
                offset,
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;

    fn source(partitions: usize, records: usize) -> Arc<InMemoryCluster> {
        let cluster = InMemoryCluster::new()
            .with_topic("src", partitions)
            .with_topic("dst", partitions);
        for p in 0..partitions as i32 {
            cluster
                .append_values(&TopicPartition::new("src", p), &format!("p{}", p), records, 0)
                .unwrap();
        }
        Arc::new(cluster)
    }

    fn values(cluster: &InMemoryCluster, topic: &str, partition: i32) -> Vec<String> {
        cluster
            .records(&TopicPartition::new(topic, partition))
            .iter()
            .map(|r| String::from_utf8_lossy(r.value.as_deref().unwrap_or_default()).into_owned())
            .collect()
    }

    #[test]
    fn test_resolve_range() {
        let wm = Watermark::new(10, 20);
        assert_eq!(resolve_range(None, wm, None), OffsetRange::new(10, 20));
        assert_eq!(
            resolve_range(Some(OffsetRange::new(0, 15)), wm, None),
            OffsetRange::new(10, 15)
        );
        assert_eq!(
            resolve_range(Some(OffsetRange::new(25, 30)), wm, None),
            OffsetRange::new(25, 25)
        );

        assert_eq!(resolve_range(None, wm, Some(4)), OffsetRange::new(16, 20));
        assert_eq!(resolve_range(None, wm, Some(50)), OffsetRange::new(10, 20));
        assert_eq!(
            resolve_range(Some(OffsetRange::new(0, 15)), wm, Some(2)),
            OffsetRange::new(13, 15)
        );
    }

    #[tokio::test]
    async fn test_copies_every_partition_in_order() {
        let cluster = source(3, 25);
        let mut options = PipeOptions::default();
        options.batch_size = 7;
        options.fetch_max_bytes = 40;
        let config = PipeConfig::new("src", "dst").with_options(options);

        let report = MessagePipe::new(cluster.clone(), cluster.clone())
            .run(&config)
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.total_copied, 75);
        for p in 0..3 {
            assert_eq!(values(&cluster, "dst", p), values(&cluster, "src", p));
            assert_eq!(report.partition(p).unwrap().next_offset, 25);
        }
    }

    #[tokio::test]
    async fn test_explicit_range_and_limit() {
        let cluster = source(1, 50);
        let mut options = PipeOptions::default();
        options.record_limit = Some(5);
        let config = PipeConfig::new("src", "dst")
            .with_range(0, OffsetRange::new(10, 40))
            .with_options(options);

        let report = MessagePipe::new(cluster.clone(), cluster.clone())
            .run(&config)
            .await
            .unwrap();

        assert_eq!(report.total_copied, 5);
        assert_eq!(
            values(&cluster, "dst", 0),
            vec!["p0-10", "p0-11", "p0-12", "p0-13", "p0-14"]
        );
        assert_eq!(report.partition(0).unwrap().next_offset, 15);
    }

    #[tokio::test]
    async fn test_fetch_failure_only_stops_that_partition() {
        let cluster = source(2, 10);
        cluster.fail_fetches(&TopicPartition::new("src", 1), 5);
        let config = PipeConfig::new("src", "dst");

        let report = MessagePipe::new(cluster.clone(), cluster.clone())
            .run(&config)
            .await
            .unwrap();

        assert!(report.partition(0).unwrap().is_completed());
        assert_eq!(report.partition(0).unwrap().records_copied, 10);
        let failed = report.partition(1).unwrap();
        assert_eq!(
            failed.failure().map(|f| f.kind),
            Some(crate::pipe::FailureKind::Broker)
        );
        assert_eq!(failed.next_offset, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cluster = source(2, 10);
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let report = MessagePipe::new(cluster.clone(), cluster.clone())
            .with_shutdown(shutdown)
            .run(&PipeConfig::new("src", "dst"))
            .await
            .unwrap();

        assert_eq!(report.total_copied, 0);
        assert!(report
            .partitions
            .iter()
            .all(|p| p.status == PartitionStatus::Cancelled));
        assert_eq!(cluster.produce_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_source_partition() {
        let cluster = source(2, 1);
        let config = PipeConfig::new("src", "dst").with_partitions(vec![0, 5]);
        let err = MessagePipe::new(cluster.clone(), cluster)
            .run(&config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionNotFound(tp) if tp.partition == 5));
    }
}
