// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{future::Future, num::NonZeroUsize, sync::Arc, time::Duration};

use assert2::{check, let_assert};
use graphqlmetrics::{
    AggregatedUsageReport, Claims, DedupCache, IngestError, MetricsConfig, MetricsService,
    MetricsServiceBuilder, Request, UsageReport,
};
use graphqlmetrics_core::{
    AggregatedUsageRecord, ArgumentUsage, FieldUsage, InputUsage, SchemaUsageRecord, StorageResult,
    StorageSink,
    memory::{MemoryBatch, MemorySink},
};
use metrique::test_util::{TestEntrySink, test_entry_sink};
use tokio::sync::Semaphore;

const OPERATIONS: &str = "gql_metrics_operations";
const USAGE: &str = "gql_metrics_schema_usage";

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(workers: usize, queue_capacity: usize) -> MetricsConfig {
    let mut config = MetricsConfig::default();
    config.pool.workers = workers;
    config.pool.queue_capacity = queue_capacity;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_jitter_ms = 0;
    config
}

fn claims() -> Claims {
    Claims::new("org-1", "graph-1")
}

fn record(hash: &str, document: &str) -> SchemaUsageRecord {
    SchemaUsageRecord {
        operation_hash: hash.into(),
        operation_name: "Employees".into(),
        request_document: document.into(),
        schema_version: "v1".into(),
        http_status_code: 200,
        field_usages: vec![
            FieldUsage {
                path: vec!["employees".into()],
                type_names: vec!["Query".into()],
                subgraph_ids: vec!["employees".into()],
                count: 1,
                named_type: "Employee".into(),
            },
            FieldUsage {
                path: vec!["employees".into(), "id".into()],
                type_names: vec!["Employee".into()],
                subgraph_ids: vec!["employees".into()],
                count: 1,
                named_type: "ID".into(),
            },
        ],
        ..Default::default()
    }
}

fn report(records: Vec<SchemaUsageRecord>) -> Request<UsageReport> {
    Request::authenticated(
        claims(),
        UsageReport {
            schema_usage: records,
        },
    )
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// A sink whose `prepare_batch` waits for a permit, so the pool's workers can be held busy.
#[derive(Clone)]
struct GatedSink {
    inner: MemorySink,
    gate: Arc<Semaphore>,
}

impl StorageSink for GatedSink {
    type Batch = MemoryBatch;

    fn prepare_batch(&self, table: &str) -> impl Future<Output = StorageResult<MemoryBatch>> + Send {
        let table = table.to_owned();
        async move {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.prepare_batch(&table).await
        }
    }
}

#[tokio::test]
async fn admission_beyond_capacity_fails_fast() {
    init_logging();
    let gate = Arc::new(Semaphore::new(0));
    let inner = MemorySink::new();
    let sink = Arc::new(GatedSink {
        inner: inner.clone(),
        gate: Arc::clone(&gate),
    });
    let service = MetricsService::new(config(2, 3), sink).unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(1), async {
        (0..20)
            .map(|i| service.publish_metrics(report(vec![record(&format!("hash-{i}"), "{ a }")])))
            .collect::<Vec<_>>()
    })
    .await
    .expect("publishing must not block");

    let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
    check!(admitted == 5);
    check!(
        outcomes[5..]
            .iter()
            .all(|r| *r == Err(IngestError::PublishFailed))
    );

    gate.add_permits(Semaphore::MAX_PERMITS / 2);
    check!(service.shutdown(Duration::from_secs(5)).await);
    check!(inner.operation_rows(OPERATIONS).len() == 5);
    check!(inner.usage_rows(USAGE).len() == 10);
}

#[tokio::test]
async fn resent_operation_is_stored_once() {
    init_logging();
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(4, 8), Arc::clone(&sink)).unwrap();

    service
        .publish_metrics(report(vec![record("1234", "query A { a }")]))
        .unwrap();
    let cache = Arc::clone(service.dedup_cache());
    eventually("first write", || cache.contains("1234")).await;

    service
        .publish_metrics(report(vec![record("1234", "query A { a b }")]))
        .unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    let operations = sink.operation_rows(OPERATIONS);
    check!(operations.len() == 1);
    check!(operations[0].request_document == "query A { a }");
    // usage is recorded for every report
    check!(sink.usage_rows(USAGE).len() == 4);
}

#[tokio::test]
async fn duplicates_within_one_report_are_stored_once() {
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 1), Arc::clone(&sink)).unwrap();

    service
        .publish_metrics(report(vec![
            record("1234", "query A { a }"),
            record("5678", "query B { b }"),
            record("1234", "query A { a }"),
        ]))
        .unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    let hashes: Vec<_> = sink
        .operation_rows(OPERATIONS)
        .into_iter()
        .map(|row| row.operation_hash)
        .collect();
    check!(hashes == ["1234", "5678"]);
    check!(sink.usage_rows(USAGE).len() == 6);
}

#[tokio::test]
async fn aggregated_reports_are_expanded() {
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 1), Arc::clone(&sink)).unwrap();

    let request = Request::authenticated(
        claims(),
        AggregatedUsageReport {
            aggregation: vec![AggregatedUsageRecord {
                schema_usage: SchemaUsageRecord {
                    field_usages: vec![FieldUsage {
                        count: 1,
                        ..Default::default()
                    }],
                    ..record("agg", "query { a }")
                },
                request_count: 5,
            }],
        },
    );
    service.publish_aggregated_metrics(request).unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    let usage = sink.usage_rows(USAGE);
    check!(usage.len() == 1);
    check!(usage[0].count == 5);
    check!(usage[0].operation_hash == "agg");
    check!(sink.operation_rows(OPERATIONS).len() == 1);
}

#[tokio::test]
async fn usage_rows_are_sorted_and_tagged() {
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 1), Arc::clone(&sink)).unwrap();

    let record = SchemaUsageRecord {
        field_usages: vec![FieldUsage {
            path: vec!["a".into()],
            type_names: vec!["Y".into(), "X".into()],
            subgraph_ids: vec!["b".into(), "a".into()],
            count: 1,
            ..Default::default()
        }],
        argument_usages: vec![ArgumentUsage {
            type_name: "Query".into(),
            count: 1,
            ..Default::default()
        }],
        input_usages: vec![InputUsage {
            type_name: "Filter".into(),
            count: 1,
            ..Default::default()
        }],
        ..record("sorted", "query { a }")
    };
    service.publish_metrics(report(vec![record])).unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    let usage = sink.usage_rows(USAGE);
    check!(usage.len() == 3);
    check!(usage[0].subgraph_ids == ["a", "b"]);
    check!(usage[0].type_names == ["X", "Y"]);
    check!(usage[0].organization_id == "org-1");
    check!(usage[0].federated_graph_id == "graph-1");
    check!(usage[1].is_argument_metric && !usage[1].is_input_metric);
    check!(usage[2].is_input_metric && !usage[2].is_argument_metric);
}

#[tokio::test]
async fn unauthenticated_requests_write_nothing() {
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 1), Arc::clone(&sink)).unwrap();

    let_assert!(
        Err(IngestError::NotAuthenticated) =
            service.publish_metrics(Request::new(UsageReport::default()))
    );
    let_assert!(
        Err(IngestError::NotAuthenticated) = service.publish_aggregated_metrics(Request::new(
            AggregatedUsageReport::default()
        ))
    );
    check!(service.shutdown(Duration::from_secs(5)).await);

    check!(sink.prepared() == 0);
    check!(sink.operation_rows(OPERATIONS).is_empty());
    check!(sink.usage_rows(USAGE).is_empty());
}

#[tokio::test]
async fn empty_reports_are_acknowledged_without_writes() {
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 0), Arc::clone(&sink)).unwrap();

    for _ in 0..10 {
        check!(service.publish_metrics(report(Vec::new())).is_ok());
    }
    check!(service.shutdown(Duration::from_secs(5)).await);
    check!(sink.prepared() == 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    init_logging();
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 1), Arc::clone(&sink)).unwrap();

    sink.fail_next_sends(2);
    service
        .publish_metrics(report(vec![record("1234", "query { a }")]))
        .unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    // two failed operation sends, then one each for operations and usage
    check!(sink.sends() == 4);
    check!(sink.operation_rows(OPERATIONS).len() == 1);
    check!(sink.usage_rows(USAGE).len() == 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_the_hash_unseen() {
    init_logging();
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 1), Arc::clone(&sink)).unwrap();

    sink.fail_all_sends(true);
    service
        .publish_metrics(report(vec![record("1234", "query { a }")]))
        .unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    // three attempts per table, each with a fresh batch
    check!(sink.sends() == 6);
    check!(sink.prepared() == 6);
    check!(sink.total_rows() == 0);
    check!(!service.dedup_cache().contains("1234"));
}

#[tokio::test(start_paused = true)]
async fn failed_append_aborts_the_batch() {
    let sink = Arc::new(MemorySink::new());
    let service = MetricsService::new(config(1, 1), Arc::clone(&sink)).unwrap();

    sink.reject_appends(true);
    service
        .publish_metrics(report(vec![record("1234", "query { a }")]))
        .unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    check!(sink.aborts() == 6);
    check!(sink.sends() == 0);
    check!(sink.total_rows() == 0);
}

#[tokio::test]
async fn injected_cache_is_shared() {
    let cache = Arc::new(DedupCache::new(NonZeroUsize::new(16).unwrap()));
    cache.add("1234");
    let sink = Arc::new(MemorySink::new());
    let service = MetricsServiceBuilder::new(config(1, 1))
        .dedup_cache(Arc::clone(&cache))
        .build(Arc::clone(&sink))
        .unwrap();

    service
        .publish_metrics(report(vec![record("1234", "query { a }")]))
        .unwrap();
    check!(service.shutdown(Duration::from_secs(5)).await);

    check!(sink.operation_rows(OPERATIONS).is_empty());
    check!(sink.usage_rows(USAGE).len() == 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_deadline_abandons_blocked_writes() {
    let gate = Arc::new(Semaphore::new(0));
    let inner = MemorySink::new();
    let sink = Arc::new(GatedSink {
        inner: inner.clone(),
        gate,
    });
    let service = MetricsService::new(config(1, 4), sink).unwrap();

    for i in 0..3 {
        service
            .publish_metrics(report(vec![record(&format!("hash-{i}"), "{ a }")]))
            .unwrap();
    }
    check!(!service.shutdown(Duration::from_millis(50)).await);
    check!(inner.total_rows() == 0);
    let_assert!(
        Err(IngestError::PublishFailed) =
            service.publish_metrics(report(vec![record("late", "{ a }")]))
    );
}

#[tokio::test]
async fn emits_self_metrics() {
    let TestEntrySink { inspector, sink: metrics_sink } = test_entry_sink();
    let sink = Arc::new(MemorySink::new());
    let service = MetricsServiceBuilder::new(config(1, 1))
        .metrics_sink(metrics_sink)
        .build(Arc::clone(&sink))
        .unwrap();

    service
        .publish_metrics(report(vec![record("1234", "query { a }")]))
        .unwrap();
    let _ = service.publish_metrics(Request::new(UsageReport::default()));
    check!(service.shutdown(Duration::from_secs(5)).await);

    let entries = inspector.entries();
    let publishes: Vec<_> = entries
        .iter()
        .filter(|entry| entry.values.contains_key("Operation"))
        .collect();
    check!(publishes.len() == 2);
    check!(publishes[0].values["Operation"] == "PublishMetrics");
    check!(publishes[0].metrics["Records"].as_u64() == 1);
    check!(publishes[0].metrics["UsageRows"].as_u64() == 2);
    check!(publishes[0].metrics["Rejected"].as_u64() == 0);
    check!(publishes[1].metrics["NotAuthenticated"].as_u64() == 1);

    let mut writes: Vec<_> = entries
        .iter()
        .filter_map(|entry| {
            Some((
                entry.values.get("Table")?.clone(),
                entry.metrics["Rows"].as_u64(),
                entry.metrics["Attempts"].as_u64(),
                entry.metrics["Success"].as_u64(),
            ))
        })
        .collect();
    writes.sort();
    check!(
        writes
            == [
                (OPERATIONS.to_owned(), 1, 1, 1),
                (USAGE.to_owned(), 2, 1, 1),
            ]
    );
}
