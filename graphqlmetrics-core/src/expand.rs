// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Expansion of aggregated reports into flat ones.
//!
//! An [`AggregatedUsageRecord`] with `request_count = n` stands for `n` identical executions. Expanding it
//! multiplies every usage count by `n` and leaves all other fields untouched, so the flat and aggregated publish
//! paths produce the same rows for the same traffic.

use crate::model::{AggregatedUsageRecord, AggregatedUsageReport, SchemaUsageRecord, UsageReport};

impl AggregatedUsageRecord {
    /// Fold `request_count` into the usage counts of the wrapped record.
    pub fn expand(self) -> SchemaUsageRecord {
        let factor = self.request_count;
        let mut record = self.schema_usage;
        for usage in &mut record.field_usages {
            usage.count = usage.count.saturating_mul(factor);
        }
        for usage in &mut record.argument_usages {
            usage.count = usage.count.saturating_mul(factor);
        }
        for usage in &mut record.input_usages {
            usage.count = usage.count.saturating_mul(factor);
        }
        record
    }
}

impl AggregatedUsageReport {
    /// Expand every aggregated record, keeping their order.
    pub fn expand(self) -> UsageReport {
        UsageReport {
            schema_usage: self
                .aggregation
                .into_iter()
                .map(AggregatedUsageRecord::expand)
                .collect(),
        }
    }
}
