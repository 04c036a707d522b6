// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;

/// Retries a fallible async operation with exponential backoff and additive jitter.
///
/// The delay before attempt `n + 1` is `base_delay * 2^(n - 1)` plus a uniformly random duration in
/// `[0, max_jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    /// A `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds or `max_attempts` attempts have failed, returning the last error unchanged.
    pub async fn run<T, E, F, Fut>(&self, op_name: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_counted(op_name, operation).await.0
    }

    /// Like [`run`](Self::run), also returning how many attempts were made.
    pub async fn run_counted<T, E, F, Fut>(&self, op_name: &str, mut operation: F) -> (Result<T, E>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if attempt >= self.max_attempts => return (Err(err), attempt),
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    tracing::debug!(
                        op_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        error = %err,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// The delay after `failed` consecutive failures.
    fn delay_after(&self, failed: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(failed.saturating_sub(1)));
        backoff.saturating_add(self.jitter())
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(0..=max))
    }
}
