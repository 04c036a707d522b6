// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The storage contract consumed by the ingestion service.
//!
//! A [`StorageSink`] hands out [`Batch`]es for a table. Rows are appended locally and become durable only once
//! [`Batch::send`] succeeds; [`Batch::abort`] discards them. Connection pooling and the wire protocol are the
//! implementation's business, and implementations must be safe to use from many tasks at once.

use std::future::Future;

use crate::row::Row;

/// Errors reported by a [`StorageSink`] or [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The sink (or batch) no longer accepts work.
    #[error("storage sink is closed")]
    Closed,
    /// The store refused a row or a batch.
    #[error("rejected by storage: {0}")]
    Rejected(String),
    /// The store could not be reached.
    #[error("storage connection error: {0}")]
    Connection(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A store that accepts prepared batch inserts.
pub trait StorageSink: Send + Sync + 'static {
    type Batch: Batch;

    /// Start a batch insert into `table`.
    fn prepare_batch(&self, table: &str) -> impl Future<Output = StorageResult<Self::Batch>> + Send;
}

/// A pending batch insert.
pub trait Batch: Send {
    /// Buffer `row` in this batch.
    fn append(&mut self, row: Row) -> StorageResult<()>;

    /// Write every appended row.
    fn send(self) -> impl Future<Output = StorageResult<()>> + Send;

    /// Discard the batch without writing anything.
    fn abort(self) -> impl Future<Output = StorageResult<()>> + Send;

    /// Number of rows appended so far.
    fn row_count(&self) -> usize;
}
