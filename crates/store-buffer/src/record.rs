// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Accounted overhead of a buffered record and the bookkeeping that travels with it
/// through the queue (delegate handle, completion channel, node allocation).
pub const QUEUE_NODE_OVERHEAD_IN_BYTES: usize = 256;

/// A topic and partition of the upstream log.
///
/// The topic is reference counted so that keys can be cloned into the per-partition
/// bookkeeping of the drainers without copying the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: Arc<str>,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A record polled from the upstream log.
///
/// The buffer never looks into key or value; they only contribute to the accounted
/// size of the record.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    topic_partition: TopicPartition,
    offset: i64,
    key: Bytes,
    value: Option<Bytes>,
}

impl ConsumerRecord {
    pub fn new(
        topic_partition: TopicPartition,
        offset: i64,
        key: impl Into<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            key: key.into(),
            value,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// `None` for tombstones.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn serialized_key_size(&self) -> usize {
        self.key.len()
    }

    pub fn serialized_value_size(&self) -> usize {
        self.value.as_ref().map_or(0, Bytes::len)
    }

    /// Number of bytes this record is accounted for while it sits in a drainer queue.
    pub fn buffered_size(&self) -> usize {
        self.serialized_key_size()
            + self.serialized_value_size()
            + self.topic().len()
            + QUEUE_NODE_OVERHEAD_IN_BYTES
    }
}

/// Never prints key or value, so it is safe to log regardless of payload size.
impl fmt::Display for ConsumerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (key: {} bytes, value: ",
            self.topic_partition,
            self.offset,
            self.serialized_key_size()
        )?;
        match &self.value {
            Some(value) => write!(f, "{} bytes)", value.len()),
            None => f.write_str("tombstone)"),
        }
    }
}
