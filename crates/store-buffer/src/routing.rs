// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Assignment of topic partitions to drainers.
//!
//! All records of a topic partition must be processed by the same drainer, otherwise
//! their processing order is lost. The assignment is therefore a pure function of the
//! topic, the partition and the number of drainers.

use std::num::NonZeroUsize;

/// Polynomial string hash (`h = 31 * h + b`) over the topic bytes, with wrapping
/// arithmetic. Stable across calls, processes and platforms.
pub fn topic_hash(topic: &str) -> i32 {
    topic
        .bytes()
        .fold(0i32, |hash, b| hash.wrapping_mul(31).wrapping_add(i32::from(b)))
}

/// Returns the index of the drainer in charge of `topic`/`partition`, in
/// `[0, drainer_count)`.
///
/// The topic hash is halved before taking its absolute value, which keeps it at or
/// below `i32::MAX / 2 + 1`; adding the partition therefore stays positive for any
/// realistic partition number and partitions of a topic spread evenly over the drainers.
/// Absolute values are taken after each step so that overflowing inputs still land in
/// range.
///
/// `drainer_count` must fit in an `i32`.
pub fn drainer_index(topic: &str, partition: i32, drainer_count: NonZeroUsize) -> usize {
    debug_assert!(drainer_count.get() <= i32::MAX as usize);
    let drainer_count = drainer_count.get() as i32;
    let topic_hash = (topic_hash(topic) / 2).wrapping_abs();
    (topic_hash.wrapping_add(partition) % drainer_count).unsigned_abs() as usize
}
