// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

pub mod config;
mod dedup;
mod error;
mod metrics;
mod pool;
mod retry;
mod service;

pub use config::MetricsConfig;
pub use dedup::DedupCache;
pub use error::{ConfigError, IngestError, IngestResult};
pub use pool::{Task, WorkerPool};
pub use retry::RetryPolicy;
pub use service::{MetricsService, MetricsServiceBuilder, PublishResponse, Request};

pub use graphqlmetrics_core::{AggregatedUsageReport, Claims, StorageSink, UsageReport};
