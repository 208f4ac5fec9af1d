// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io;

use bytesize::ByteSize;

#[derive(Debug, thiserror::Error)]
#[error("invalid option '{name}'. Reason: {reason}")]
pub struct OptionsError {
    pub(crate) name: &'static str,
    pub(crate) reason: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error(transparent)]
    InvalidOptions(#[from] OptionsError),
    #[error("store buffer service was already started")]
    AlreadyStarted,
    #[error("failed spawning drainer thread {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("drainer {index} stopped after an unrecoverable fault and no longer drains its queue")]
    DrainerFailed { index: usize },
    #[error("store buffer service is shutting down")]
    ShuttingDown,
    #[error("record of {size} for drainer {index} exceeds its buffer capacity of {capacity}")]
    RecordTooLarge {
        index: usize,
        size: ByteSize,
        capacity: ByteSize,
    },
    #[error(
        "there are still records left in the queue of drainer {index} for topic {topic} partition {partition} after {retries} retries"
    )]
    DrainTimeout {
        index: usize,
        topic: String,
        partition: i32,
        retries: usize,
    },
}
