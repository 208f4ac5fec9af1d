// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Buffering between the thread polling the upstream log and the threads persisting
//! its records.
//!
//! This crate provides:
//! - [`StoreBufferService`]: a fixed pool of drainer threads, each owning a memory bounded
//!   queue, that process the records of a topic partition strictly in order
//! - [`ProcessingDelegate`]: the persistence logic records are handed to
//! - [`RecordPersistedFuture`] and [`ProducedRecord`]: the two ways of learning that a
//!   buffered record has been processed
//! - [`MemoryBoundQueue`]: the blocking queue bounded by the byte size of its entries

mod completion;
mod delegate;
mod drainer;
mod error;
mod metric_definitions;
mod options;
pub mod queue;
pub mod record;
pub mod routing;
mod service;

pub use completion::{ProducedRecord, RecordPersistedFuture};
pub use delegate::{PartitionConsumptionState, ProcessingDelegate, ProcessingError};
pub use drainer::DrainerStatus;
pub use error::{BufferError, OptionsError};
pub use metric_definitions::*;
pub use options::{StoreBufferOptions, StoreBufferOptionsBuilder};
pub use queue::{MemoryBoundQueue, QueueEntry};
pub use record::{ConsumerRecord, TopicPartition};
pub use service::StoreBufferService;
