// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{io, path::PathBuf};

/// Errors visible to callers of the publish operations.
///
/// Storage failures never show up here: they happen after the response and are only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    /// The request carried no claims.
    #[error("request is not authenticated")]
    NotAuthenticated,
    /// The worker pool refused the request. The caller should retry later.
    #[error("failed to publish metrics: ingestion is at capacity")]
    PublishFailed,
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Errors loading a [`MetricsConfig`](crate::MetricsConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing configuration")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
