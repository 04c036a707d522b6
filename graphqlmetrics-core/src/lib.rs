// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

mod expand;
pub mod model;
pub mod row;
pub mod sink;

#[cfg(feature = "test-util")]
pub mod memory;

pub use model::{
    AggregatedUsageRecord, AggregatedUsageReport, ArgumentUsage, Claims, FieldUsage, InputUsage,
    OperationType, SchemaUsageRecord, UsageReport,
};
pub use row::{OperationRecord, Row, UsageKind, UsageMetricRecord, usage_metric_rows};
pub use sink::{Batch, StorageError, StorageResult, StorageSink};
