// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Service configuration, loaded from TOML.
//!
//! Every key is optional. A missing section or key falls back to the defaults below.
//!
//! ```toml
//! [pool]
//! workers = 32
//! queue_capacity = 2000
//!
//! [retry]
//! max_attempts = 3
//! ```

use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::{error::ConfigError, retry::RetryPolicy};

pub const DEFAULT_WORKERS: usize = 16;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_DEDUP_MAX_ENTRIES: usize = 25_000;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_JITTER_MS: u64 = 500;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_OPERATIONS_TABLE: &str = "gql_metrics_operations";
pub const DEFAULT_USAGE_TABLE: &str = "gql_metrics_schema_usage";

/// Configuration of a [`MetricsService`](crate::MetricsService).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub pool: PoolConfig,
    pub dedup: DedupConfig,
    pub retry: RetryConfig,
    pub shutdown: ShutdownConfig,
    pub storage: StorageConfig,
}

impl MetricsConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the TOML file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1"));
        }
        if self.dedup.max_entries == 0 {
            return Err(ConfigError::Invalid("dedup.max_entries must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of concurrent storage writers.
    pub workers: usize,
    /// Number of admitted requests that may wait for a writer.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// Number of operation hashes remembered.
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_DEDUP_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_jitter_ms: DEFAULT_RETRY_MAX_JITTER_MS,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_jitter_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    /// How long [`MetricsService::shutdown`](crate::MetricsService::shutdown) waits for admitted work.
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub operations_table: String,
    pub usage_table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            operations_table: DEFAULT_OPERATIONS_TABLE.into(),
            usage_table: DEFAULT_USAGE_TABLE.into(),
        }
    }
}
