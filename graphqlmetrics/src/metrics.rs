// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Self-metrics of the ingestion service.
//!
//! Every publish call emits one [`PublishMetrics`] entry when the call returns. Every table write performed by a
//! worker emits one [`WriteMetrics`] entry once its retries are over.

use metrique::{
    DefaultSink,
    timers::Timer,
    unit::Count,
    unit_of_work::metrics,
};

#[metrics(rename_all = "PascalCase")]
#[derive(Default)]
pub(crate) struct PublishMetrics {
    operation: &'static str,
    #[metrics(unit = Count)]
    pub(crate) records: usize,
    #[metrics(unit = Count)]
    pub(crate) usage_rows: usize,
    pub(crate) not_authenticated: bool,
    pub(crate) rejected: bool,
    time: Timer,
}

impl PublishMetrics {
    pub(crate) fn init(operation: &'static str, sink: DefaultSink) -> PublishMetricsGuard {
        Self {
            operation,
            ..Default::default()
        }
        .append_on_drop(sink)
    }
}

#[metrics(rename_all = "PascalCase")]
#[derive(Default)]
pub(crate) struct WriteMetrics {
    table: String,
    #[metrics(unit = Count)]
    pub(crate) rows: usize,
    #[metrics(unit = Count)]
    pub(crate) attempts: u32,
    pub(crate) success: bool,
    time: Timer,
}

impl WriteMetrics {
    pub(crate) fn init(table: &str, sink: DefaultSink) -> WriteMetricsGuard {
        Self {
            table: table.to_owned(),
            ..Default::default()
        }
        .append_on_drop(sink)
    }
}
