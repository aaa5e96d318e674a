//! Message pipe tests.
//!
//! Covers:
//! - Pre-flight partition count checks
//! - Per-partition ordering across clusters
//! - Avro decode failures halting only their own partition
//! - Skipping undecodable records
//! - Reading past transaction markers
//! - Copying the last N records of each partition

use bytes::Bytes;
use std::sync::Arc;

use kafka_ops_core::cluster::memory::InMemoryCluster;
use kafka_ops_core::pipe::{FailureKind, OffsetRange, PartitionStatus};
use kafka_ops_core::{
    run_pipe, AvroCodec, Error, PipeConfig, PipeOptions, RecordCodec, Shutdown,
};

use super::helpers::{
    cluster_with_topic, tp, user_payload, user_registry, values, PrefixRejectingCodec,
    BASE_TIMESTAMP,
};

#[tokio::test]
async fn too_few_destination_partitions_writes_nothing() {
    let cluster = cluster_with_topic("src", 2, 20);
    cluster.create_topic("dst", 1);

    let err = run_pipe(
        Arc::clone(&cluster),
        Arc::clone(&cluster),
        None,
        &PipeConfig::new("src", "dst"),
        Shutdown::new(),
    )
    .await
    .unwrap_err();

    match err {
        Error::PartitionCountMismatch {
            required,
            destination_partitions,
            ..
        } => {
            assert_eq!(required, 2);
            assert_eq!(destination_partitions, 1);
        }
        other => panic!("expected PartitionCountMismatch, got {other:?}"),
    }
    assert_eq!(cluster.produce_calls(), 0);
    assert!(cluster.records(&tp("dst", 0)).is_empty());
}

#[tokio::test]
async fn records_keep_their_relative_order_across_clusters() {
    let source = InMemoryCluster::new().with_topic("events", 1);
    source
        .append_values(&tp("events", 0), "e", 13, BASE_TIMESTAMP)
        .unwrap();
    source.truncate_before(&tp("events", 0), 10);
    let source = Arc::new(source);
    let destination = Arc::new(InMemoryCluster::new().with_topic("events-copy", 1));

    let mut options = PipeOptions::default();
    options.batch_size = 1;
    let config = PipeConfig::new("events", "events-copy").with_options(options);

    let report = run_pipe(
        Arc::clone(&source),
        Arc::clone(&destination),
        None,
        &config,
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.total_copied, 3);
    assert_eq!(
        values(&destination, &tp("events-copy", 0)),
        vec!["e-10", "e-11", "e-12"]
    );
    let copied = destination.records(&tp("events-copy", 0));
    assert_eq!(copied[0].timestamp, BASE_TIMESTAMP + 10);
    assert_eq!(copied[2].timestamp, BASE_TIMESTAMP + 12);
    assert_eq!(destination.produce_calls(), 3);
}

#[tokio::test]
async fn decode_failure_halts_only_its_partition() {
    let (registry, schema) = user_registry();
    let cluster = InMemoryCluster::new()
        .with_topic("src", 2)
        .with_topic("dst", 2);
    for p in 0..2 {
        for i in 0..60 {
            let value = if p == 0 && i == 42 {
                Bytes::from_static(b"\x01not avro")
            } else {
                user_payload(&schema, &format!("user-{}-{}", p, i))
            };
            cluster
                .append(&tp("src", p), None, Some(value), BASE_TIMESTAMP + i as i64)
                .unwrap();
        }
    }
    let cluster = Arc::new(cluster);
    let codec: Arc<dyn RecordCodec> = Arc::new(AvroCodec::new(registry));

    let report = run_pipe(
        Arc::clone(&cluster),
        Arc::clone(&cluster),
        Some(codec),
        &PipeConfig::new("src", "dst"),
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert!(!report.is_complete());

    let failed = report.partition(0).unwrap();
    let failure = failed.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::SchemaDecode);
    assert_eq!(failure.offset, Some(42));
    assert_eq!(failed.next_offset, 42);
    assert_eq!(failed.records_copied, 42);
    assert_eq!(cluster.records(&tp("dst", 0)).len(), 42);

    let completed = report.partition(1).unwrap();
    assert_eq!(completed.status, PartitionStatus::Completed);
    assert_eq!(completed.records_copied, 60);
    assert_eq!(
        cluster.records(&tp("dst", 1))[59].value,
        cluster.records(&tp("src", 1))[59].value
    );

    let unfinished: Vec<i32> = report
        .failed_partitions()
        .iter()
        .map(|p| p.partition)
        .collect();
    assert_eq!(unfinished, vec![0]);
}

#[tokio::test]
async fn skip_on_error_drops_only_bad_records() {
    let cluster = InMemoryCluster::new()
        .with_topic("src", 1)
        .with_topic("dst", 1);
    for value in ["ok-0", "bad-1", "ok-2", "bad-3", "ok-4"] {
        cluster
            .append(
                &tp("src", 0),
                None,
                Some(Bytes::from(value)),
                BASE_TIMESTAMP,
            )
            .unwrap();
    }
    let cluster = Arc::new(cluster);

    let mut options = PipeOptions::default();
    options.skip_on_error = true;
    let config = PipeConfig::new("src", "dst").with_options(options);
    let codec: Arc<dyn RecordCodec> = Arc::new(PrefixRejectingCodec);

    let report = run_pipe(
        Arc::clone(&cluster),
        Arc::clone(&cluster),
        Some(codec),
        &config,
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.total_copied, 3);
    assert_eq!(report.total_skipped, 2);
    assert_eq!(values(&cluster, &tp("dst", 0)), vec!["ok-0", "ok-2", "ok-4"]);
    assert_eq!(report.partition(0).unwrap().next_offset, 5);
}

#[tokio::test]
async fn explicit_range_resumes_from_next_offset() {
    let cluster = cluster_with_topic("src", 1, 30);
    cluster.create_topic("dst", 1);

    let config = PipeConfig::new("src", "dst").with_range(0, OffsetRange::new(12, 18));
    let report = run_pipe(
        Arc::clone(&cluster),
        Arc::clone(&cluster),
        None,
        &config,
        Shutdown::new(),
    )
    .await
    .unwrap();

    let partition = report.partition(0).unwrap();
    assert!(partition.is_completed());
    assert_eq!(partition.records_copied, 6);
    assert_eq!(partition.next_offset, 18);
    assert_eq!(
        values(&cluster, &tp("dst", 0)),
        (12..18).map(|o| format!("v-{}", o)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn transaction_markers_do_not_end_the_copy() {
    let source = InMemoryCluster::new().with_topic("txn", 1);
    let src = tp("txn", 0);
    source.append_values(&src, "a", 2, BASE_TIMESTAMP).unwrap();
    source.append_marker(&src).unwrap();
    source.append_values(&src, "b", 2, BASE_TIMESTAMP).unwrap();
    source.append_marker(&src).unwrap();
    let source = Arc::new(source);
    let destination = Arc::new(InMemoryCluster::new().with_topic("txn-copy", 1));

    // One log entry per fetch, so one fetch returns nothing but a marker
    let mut options = PipeOptions::default();
    options.fetch_max_bytes = 1;
    let config = PipeConfig::new("txn", "txn-copy").with_options(options);

    let report = run_pipe(
        Arc::clone(&source),
        Arc::clone(&destination),
        None,
        &config,
        Shutdown::new(),
    )
    .await
    .unwrap();

    let partition = report.partition(0).unwrap();
    assert!(partition.is_completed());
    assert_eq!(partition.records_copied, 4);
    assert_eq!(partition.next_offset, 6);
    assert_eq!(
        values(&destination, &tp("txn-copy", 0)),
        vec!["a-0", "a-1", "b-3", "b-4"]
    );
}

#[tokio::test]
async fn last_records_mode_copies_the_tail_of_each_partition() {
    let cluster = cluster_with_topic("src", 2, 30);
    cluster.truncate_before(&tp("src", 1), 28);
    cluster.create_topic("dst", 2);

    let mut options = PipeOptions::default();
    options.record_limit = Some(5);
    options.from_tail = true;
    let config = PipeConfig::new("src", "dst").with_options(options);

    let report = run_pipe(
        Arc::clone(&cluster),
        Arc::clone(&cluster),
        None,
        &config,
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.partition(0).unwrap().range, OffsetRange::new(25, 30));
    assert_eq!(
        values(&cluster, &tp("dst", 0)),
        (25..30).map(|o| format!("v-{}", o)).collect::<Vec<_>>()
    );
    // fewer retained records than requested: copy what is there
    assert_eq!(report.partition(1).unwrap().range, OffsetRange::new(28, 30));
    assert_eq!(values(&cluster, &tp("dst", 1)), vec!["v-28", "v-29"]);
}

#[tokio::test]
async fn last_records_mode_needs_a_limit() {
    let cluster = cluster_with_topic("src", 1, 3);
    cluster.create_topic("dst", 1);

    let mut options = PipeOptions::default();
    options.from_tail = true;
    let config = PipeConfig::new("src", "dst").with_options(options);

    let err = run_pipe(
        Arc::clone(&cluster),
        Arc::clone(&cluster),
        None,
        &config,
        Shutdown::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Config(_)));
    assert_eq!(cluster.produce_calls(), 0);
}
