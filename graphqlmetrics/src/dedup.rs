// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// A bounded set of operation hashes already written to storage.
///
/// Least recently used hashes are evicted first, so a document that keeps being reported stays remembered while one
/// that was seen once and never again is eventually written a second time. That is acceptable: the operations table
/// tolerates duplicates, it only grows more slowly without them.
///
/// The cache is internally synchronised and meant to be shared behind an `Arc`. Checking and adding are separate
/// calls, so two concurrent writers that both miss may both write the same hash.
#[derive(Debug)]
pub struct DedupCache {
    entries: Mutex<LruCache<String, ()>>,
}

impl DedupCache {
    /// Create a cache remembering at most `max_entries` hashes.
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_entries)),
        }
    }

    /// Whether `key` was added and not evicted since. Counts as a use for eviction order.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().get(key).is_some()
    }

    pub fn add(&self, key: impl Into<String>) {
        self.entries.lock().put(key.into(), ());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
