// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`StorageSink`] for tests.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    row::{OperationRecord, Row, UsageMetricRecord},
    sink::{Batch, StorageError, StorageResult, StorageSink},
};

/// A [`StorageSink`] that keeps sent rows in memory, grouped by table.
///
/// Cloning gives another handle to the same storage. Sends can be made to fail, either a fixed number of times or
/// until told otherwise, to exercise retry paths.
///
/// # Example
/// ```
/// # use graphqlmetrics_core::{Batch, StorageSink, memory::MemorySink};
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let sink = MemorySink::new();
/// let batch = sink.prepare_batch("operations").await.unwrap();
/// batch.send().await.unwrap();
/// assert_eq!(sink.sends(), 1);
/// assert!(sink.rows("operations").is_empty());
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    prepared: usize,
    sends: usize,
    aborts: usize,
    failures_remaining: usize,
    fail_always: bool,
    reject_appends: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to [`Batch::send`] fail with [`StorageError::Connection`].
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().failures_remaining = count;
    }

    /// Make every call to [`Batch::send`] fail until called again with `false`.
    pub fn fail_all_sends(&self, fail: bool) {
        self.state.lock().fail_always = fail;
    }

    /// Make [`Batch::append`] fail with [`StorageError::Rejected`] until called again with `false`.
    pub fn reject_appends(&self, reject: bool) {
        self.state.lock().reject_appends = reject;
    }

    /// All rows successfully sent to `table`, in send order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// The operation rows sent to `table`.
    pub fn operation_rows(&self, table: &str) -> Vec<OperationRecord> {
        self.rows(table)
            .into_iter()
            .filter_map(|row| match row {
                Row::Operation(record) => Some(record),
                Row::UsageMetric(_) => None,
            })
            .collect()
    }

    /// The usage-metric rows sent to `table`.
    pub fn usage_rows(&self, table: &str) -> Vec<UsageMetricRecord> {
        self.rows(table)
            .into_iter()
            .filter_map(|row| match row {
                Row::UsageMetric(record) => Some(record),
                Row::Operation(_) => None,
            })
            .collect()
    }

    /// Total rows sent across all tables.
    pub fn total_rows(&self) -> usize {
        self.state.lock().tables.values().map(Vec::len).sum()
    }

    /// Number of batches prepared.
    pub fn prepared(&self) -> usize {
        self.state.lock().prepared
    }

    /// Number of send attempts, failed ones included.
    pub fn sends(&self) -> usize {
        self.state.lock().sends
    }

    /// Number of aborted batches.
    pub fn aborts(&self) -> usize {
        self.state.lock().aborts
    }
}

impl StorageSink for MemorySink {
    type Batch = MemoryBatch;

    async fn prepare_batch(&self, table: &str) -> StorageResult<MemoryBatch> {
        self.state.lock().prepared += 1;
        Ok(MemoryBatch {
            table: table.to_owned(),
            rows: Vec::new(),
            state: Arc::clone(&self.state),
        })
    }
}

/// A batch prepared by [`MemorySink`].
#[derive(Debug)]
pub struct MemoryBatch {
    table: String,
    rows: Vec<Row>,
    state: Arc<Mutex<MemoryState>>,
}

impl Batch for MemoryBatch {
    fn append(&mut self, row: Row) -> StorageResult<()> {
        if self.state.lock().reject_appends {
            return Err(StorageError::Rejected("injected rejection".into()));
        }
        self.rows.push(row);
        Ok(())
    }

    async fn send(self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.sends += 1;
        if state.fail_always {
            return Err(StorageError::Connection("injected failure".into()));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(StorageError::Connection("injected failure".into()));
        }
        state.tables.entry(self.table).or_default().extend(self.rows);
        Ok(())
    }

    async fn abort(self) -> StorageResult<()> {
        self.state.lock().aborts += 1;
        Ok(())
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}
