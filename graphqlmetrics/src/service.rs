// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashSet,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, SystemTime},
};

use graphqlmetrics_core::{
    AggregatedUsageReport, Batch, Claims, OperationRecord, Row, SchemaUsageRecord, StorageResult,
    StorageSink, UsageReport, usage_metric_rows,
};
use metrique::{DefaultSink, writer::sink::DevNullSink};

use crate::{
    config::{MetricsConfig, StorageConfig},
    dedup::DedupCache,
    error::{ConfigError, IngestError, IngestResult},
    metrics::{PublishMetrics, WriteMetrics},
    pool::{Task, WorkerPool},
    retry::RetryPolicy,
};

/// An inbound publish request: the report plus whatever claims the authentication layer attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<T> {
    claims: Option<Claims>,
    body: T,
}

impl<T> Request<T> {
    /// A request without claims. Publishing it fails with [`IngestError::NotAuthenticated`].
    pub fn new(body: T) -> Self {
        Self { claims: None, body }
    }

    pub fn authenticated(claims: Claims, body: T) -> Self {
        Self {
            claims: Some(claims),
            body,
        }
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_parts(self) -> (Option<Claims>, T) {
        (self.claims, self.body)
    }
}

/// Acknowledgement of an admitted report. The writes it triggers happen afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishResponse;

/// Accepts usage reports and writes them to a [`StorageSink`] in the background.
///
/// Publishing only authenticates, normalizes and admits the report. It never waits on storage and fails fast with
/// [`IngestError::PublishFailed`] when the worker pool is full. Storage writes run on the pool, each table write
/// retried on its own, and their failures are logged rather than reported.
///
/// Operation documents are written once per hash while the hash stays in the [`DedupCache`]. Usage-metric rows are
/// written for every report.
pub struct MetricsService<S> {
    writer: Arc<Writer<S>>,
    pool: WorkerPool,
    shutdown_timeout: Duration,
}

/// Builder for [`MetricsService`]
pub struct MetricsServiceBuilder {
    config: MetricsConfig,
    cache: Option<Arc<DedupCache>>,
    metrics_sink: Option<DefaultSink>,
}

impl MetricsServiceBuilder {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            cache: None,
            metrics_sink: None,
        }
    }

    /// Use `cache` instead of a fresh cache sized by `dedup.max_entries`.
    pub fn dedup_cache(mut self, cache: Arc<DedupCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Emit self-metrics to `sink`. They are discarded by default.
    pub fn metrics_sink(mut self, sink: impl Into<DefaultSink>) -> Self {
        self.metrics_sink = Some(sink.into());
        self
    }

    /// Build a service writing to `sink`.
    ///
    /// Must be called inside a tokio runtime, which the pool's workers are spawned onto.
    pub fn build<S: StorageSink>(self, sink: Arc<S>) -> Result<MetricsService<S>, ConfigError> {
        let Self {
            config,
            cache,
            metrics_sink,
        } = self;
        config.validate()?;
        let cache = match cache {
            Some(cache) => cache,
            None => {
                let max_entries = NonZeroUsize::new(config.dedup.max_entries)
                    .ok_or(ConfigError::Invalid("dedup.max_entries must be at least 1"))?;
                Arc::new(DedupCache::new(max_entries))
            }
        };
        Ok(MetricsService {
            writer: Arc::new(Writer {
                sink,
                cache,
                retry: config.retry.policy(),
                tables: config.storage,
                metrics_sink: metrics_sink.unwrap_or_else(DevNullSink::boxed),
            }),
            pool: WorkerPool::new(config.pool.workers, config.pool.queue_capacity),
            shutdown_timeout: config.shutdown.timeout(),
        })
    }
}

impl<S: StorageSink> MetricsService<S> {
    /// Build a service writing to `sink`, with its own dedup cache and worker pool.
    ///
    /// Must be called inside a tokio runtime. See [`MetricsServiceBuilder`] for the other options.
    pub fn new(config: MetricsConfig, sink: Arc<S>) -> Result<Self, ConfigError> {
        MetricsServiceBuilder::new(config).build(sink)
    }

    /// Accept a flat usage report.
    pub fn publish_metrics(&self, request: Request<UsageReport>) -> IngestResult<PublishResponse> {
        let mut metrics = PublishMetrics::init("PublishMetrics", self.writer.metrics_sink.clone());
        let (claims, report) = request.into_parts();
        let claims = authenticate(claims, &mut metrics)?;
        self.admit(claims, report.schema_usage, &mut metrics)
    }

    /// Accept an aggregated usage report. Each record is expanded into the flat record it stands for first.
    pub fn publish_aggregated_metrics(
        &self,
        request: Request<AggregatedUsageReport>,
    ) -> IngestResult<PublishResponse> {
        let mut metrics = PublishMetrics::init(
            "PublishAggregatedMetrics",
            self.writer.metrics_sink.clone(),
        );
        let (claims, report) = request.into_parts();
        let claims = authenticate(claims, &mut metrics)?;
        self.admit(claims, report.expand().schema_usage, &mut metrics)
    }

    fn admit(
        &self,
        claims: Claims,
        records: Vec<SchemaUsageRecord>,
        metrics: &mut PublishMetrics,
    ) -> IngestResult<PublishResponse> {
        metrics.records = records.len();
        metrics.usage_rows = records.iter().map(SchemaUsageRecord::usage_count).sum();
        if records.is_empty() {
            return Ok(PublishResponse);
        }

        let task = IngestTask {
            writer: Arc::clone(&self.writer),
            claims,
            records,
            insert_time: SystemTime::now(),
        };
        if !self.pool.try_submit(task) {
            metrics.rejected = true;
            tracing::debug!(
                running = self.pool.running(),
                waiting = self.pool.waiting(),
                "rejecting report, worker pool is full"
            );
            return Err(IngestError::PublishFailed);
        }
        Ok(PublishResponse)
    }

    /// Stop admitting reports and wait up to `deadline` for admitted ones to be written.
    ///
    /// Returns whether everything was written (or given up on after retries) in time.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.pool.stop_and_wait_for(deadline).await
    }

    /// The configured `shutdown.timeout_ms`.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn dedup_cache(&self) -> &Arc<DedupCache> {
        &self.writer.cache
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

impl<S> std::fmt::Debug for MetricsService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService")
            .field("tables", &self.writer.tables)
            .field("pool", &self.pool)
            .field("cache_entries", &self.writer.cache.len())
            .finish_non_exhaustive()
    }
}

fn authenticate(claims: Option<Claims>, metrics: &mut PublishMetrics) -> IngestResult<Claims> {
    claims.ok_or_else(|| {
        metrics.not_authenticated = true;
        IngestError::NotAuthenticated
    })
}

/// State shared by every background write.
struct Writer<S> {
    sink: Arc<S>,
    cache: Arc<DedupCache>,
    retry: RetryPolicy,
    tables: StorageConfig,
    metrics_sink: DefaultSink,
}

/// The background half of one admitted report. Owns its claims and records.
struct IngestTask<S> {
    writer: Arc<Writer<S>>,
    claims: Claims,
    records: Vec<SchemaUsageRecord>,
    insert_time: SystemTime,
}

impl<S: StorageSink> Task for IngestTask<S> {
    async fn run(self) {
        let Self {
            writer,
            claims,
            records,
            insert_time,
        } = self;
        writer.insert_operations(&records, insert_time).await;
        writer
            .insert_usage_metrics(&claims, &records, insert_time)
            .await;
    }
}

impl<S: StorageSink> Writer<S> {
    async fn insert_operations(&self, records: &[SchemaUsageRecord], insert_time: SystemTime) {
        let rows = self.unseen_operations(records, insert_time);
        if rows.is_empty() {
            return;
        }
        if self.write(&self.tables.operations_table, &rows).await {
            for row in rows {
                self.cache.add(row.operation_hash);
            }
        }
    }

    // operations neither remembered by the cache nor repeated earlier in `records`
    fn unseen_operations(
        &self,
        records: &[SchemaUsageRecord],
        insert_time: SystemTime,
    ) -> Vec<OperationRecord> {
        let mut seen = HashSet::new();
        let rows: Vec<_> = records
            .iter()
            .filter(|record| seen.insert(record.operation_hash.as_str()))
            .filter(|record| !self.cache.contains(&record.operation_hash))
            .map(|record| OperationRecord::new(record, insert_time))
            .collect();
        if rows.len() < records.len() {
            tracing::debug!(
                skipped = records.len() - rows.len(),
                "skipping operations that are already stored"
            );
        }
        rows
    }

    async fn insert_usage_metrics(
        &self,
        claims: &Claims,
        records: &[SchemaUsageRecord],
        insert_time: SystemTime,
    ) {
        let rows: Vec<_> = records
            .iter()
            .flat_map(|record| usage_metric_rows(claims, record, insert_time))
            .collect();
        if rows.is_empty() {
            return;
        }
        self.write(&self.tables.usage_table, &rows).await;
    }

    /// Write `rows` to `table` under the retry policy. Returns whether the write succeeded.
    async fn write<R>(&self, table: &str, rows: &[R]) -> bool
    where
        R: Clone + Into<Row> + Sync,
    {
        let mut metrics = WriteMetrics::init(table, self.metrics_sink.clone());
        metrics.rows = rows.len();
        let (result, attempts) = self
            .retry
            .run_counted(table, || self.send_batch(table, rows))
            .await;
        metrics.attempts = attempts;
        match result {
            Ok(()) => {
                metrics.success = true;
                true
            }
            Err(err) => {
                tracing::error!(
                    table,
                    rows = rows.len(),
                    attempts,
                    error = %err,
                    "giving up on writing rows"
                );
                false
            }
        }
    }

    // a fresh batch per attempt
    async fn send_batch<R>(&self, table: &str, rows: &[R]) -> StorageResult<()>
    where
        R: Clone + Into<Row> + Sync,
    {
        let mut batch = self.sink.prepare_batch(table).await?;
        for row in rows {
            if let Err(err) = batch.append(row.clone().into()) {
                if let Err(abort_err) = batch.abort().await {
                    tracing::debug!(table, error = %abort_err, "failed to abort batch");
                }
                return Err(err);
            }
        }
        batch.send().await
    }
}
