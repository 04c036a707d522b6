// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

mod accumulator;
pub(crate) mod rate_limit;

pub use accumulator::{
    AccumulatorError, BatchAccumulator, BatchAccumulatorBuilder, FlushBatch, MAX_BUFFERED_ITEMS,
};
