// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rows persisted to the columnar store.

use std::{collections::BTreeMap, time::SystemTime};

use crate::model::{Claims, OperationType, SchemaUsageRecord};

/// One row of the operations table. Written at most once per operation hash while the hash is remembered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub insert_time: SystemTime,
    pub operation_name: String,
    pub operation_hash: String,
    pub operation_type: OperationType,
    pub request_document: String,
}

impl OperationRecord {
    pub fn new(record: &SchemaUsageRecord, insert_time: SystemTime) -> Self {
        Self {
            insert_time,
            operation_name: record.operation_name.clone(),
            operation_hash: record.operation_hash.clone(),
            operation_type: record.operation_type,
            request_document: record.request_document.clone(),
        }
    }
}

/// Which kind of usage a [`UsageMetricRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Field,
    Argument,
    Input,
}

/// One row of the usage-metrics fact table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageMetricRecord {
    pub insert_time: SystemTime,
    pub organization_id: String,
    pub federated_graph_id: String,
    pub schema_version: String,
    pub operation_hash: String,
    pub operation_name: String,
    pub operation_type: OperationType,
    pub count: u64,
    pub path: Vec<String>,
    /// Sorted.
    pub type_names: Vec<String>,
    pub named_type: String,
    pub client_name: String,
    pub client_version: String,
    pub http_status_code: i32,
    pub has_error: bool,
    /// Sorted.
    pub subgraph_ids: Vec<String>,
    pub is_argument_metric: bool,
    pub is_input_metric: bool,
    pub attributes: BTreeMap<String, String>,
}

impl UsageMetricRecord {
    pub fn kind(&self) -> UsageKind {
        match (self.is_argument_metric, self.is_input_metric) {
            (true, _) => UsageKind::Argument,
            (false, true) => UsageKind::Input,
            (false, false) => UsageKind::Field,
        }
    }
}

/// Build the usage-metric rows for every field, argument and input usage in `record`, in that order.
///
/// Type names and subgraph ids are sorted. They are sets, and a stable order compresses better and keeps the
/// column's cardinality down.
pub fn usage_metric_rows(
    claims: &Claims,
    record: &SchemaUsageRecord,
    insert_time: SystemTime,
) -> Vec<UsageMetricRecord> {
    let row = |kind: UsageKind,
               path: &[String],
               mut type_names: Vec<String>,
               subgraph_ids: &[String],
               count: u64,
               named_type: &str| {
        let mut subgraph_ids = subgraph_ids.to_vec();
        subgraph_ids.sort_unstable();
        type_names.sort_unstable();
        UsageMetricRecord {
            insert_time,
            organization_id: claims.organization_id.clone(),
            federated_graph_id: claims.federated_graph_id.clone(),
            schema_version: record.schema_version.clone(),
            operation_hash: record.operation_hash.clone(),
            operation_name: record.operation_name.clone(),
            operation_type: record.operation_type,
            count,
            path: path.to_vec(),
            type_names,
            named_type: named_type.to_owned(),
            client_name: record.client_name.clone(),
            client_version: record.client_version.clone(),
            http_status_code: record.http_status_code,
            has_error: record.has_error,
            subgraph_ids,
            is_argument_metric: kind == UsageKind::Argument,
            is_input_metric: kind == UsageKind::Input,
            attributes: record.attributes.clone(),
        }
    };

    let mut rows = Vec::with_capacity(record.usage_count());
    rows.extend(record.field_usages.iter().map(|usage| {
        row(
            UsageKind::Field,
            &usage.path,
            usage.type_names.clone(),
            &usage.subgraph_ids,
            usage.count,
            &usage.named_type,
        )
    }));
    rows.extend(record.argument_usages.iter().map(|usage| {
        row(
            UsageKind::Argument,
            &usage.path,
            vec![usage.type_name.clone()],
            &usage.subgraph_ids,
            usage.count,
            &usage.named_type,
        )
    }));
    rows.extend(record.input_usages.iter().map(|usage| {
        row(
            UsageKind::Input,
            &usage.path,
            vec![usage.type_name.clone()],
            &usage.subgraph_ids,
            usage.count,
            &usage.named_type,
        )
    }));
    rows
}

/// A row appended to a [`Batch`](crate::sink::Batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Operation(OperationRecord),
    UsageMetric(UsageMetricRecord),
}

impl From<OperationRecord> for Row {
    fn from(value: OperationRecord) -> Self {
        Row::Operation(value)
    }
}

impl From<UsageMetricRecord> for Row {
    fn from(value: UsageMetricRecord) -> Self {
        Row::UsageMetric(value)
    }
}
