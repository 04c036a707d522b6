// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

// shared by every macro call site so that all of them measure against one clock
#[doc(hidden)]
pub(crate) fn elapsed_since_first_use() -> Duration {
    static STARTED: OnceLock<Instant> = OnceLock::new();
    STARTED.get_or_init(Instant::now).elapsed()
}

/// `rate_limited!(interval, expr)` evaluates `expr` at most once per `interval` for each call site.
///
/// The accumulator loop logs flush failures through this so that a storage outage turns into one error line per
/// interval rather than one per trigger.
macro_rules! rate_limited {
    ($interval:expr, $call:expr) => {{
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_ALLOWED_SECS: AtomicU64 = AtomicU64::new(0);
        let interval: std::time::Duration = $interval;
        debug_assert!(
            interval >= std::time::Duration::from_secs(1),
            "rate limiting works at second granularity"
        );

        let now = $crate::rate_limit::elapsed_since_first_use();
        let next = NEXT_ALLOWED_SECS.load(Ordering::Relaxed);
        if next <= now.as_secs() {
            let following = now.saturating_add(interval).as_secs();
            if NEXT_ALLOWED_SECS
                .compare_exchange(next, following, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                $call;
            }
        }
    }};
}
pub(crate) use rate_limited;
