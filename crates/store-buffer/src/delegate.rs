// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::any::Any;
use std::sync::Arc;

use crate::completion::{ProducedRecord, RecordPersistedFuture};
use crate::record::ConsumerRecord;

/// Outcome of processing a single buffered record.
///
/// `Checksum` and `Failed` are recoverable: they only fail the record they were raised
/// for. `Unrecoverable` stops the drainer that processed the record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessingError {
    #[error("checksum verification failed: {0}")]
    Checksum(Arc<anyhow::Error>),
    #[error("failed processing record: {0}")]
    Failed(Arc<anyhow::Error>),
    #[error("unrecoverable fault while processing record: {0}")]
    Unrecoverable(Arc<anyhow::Error>),
    /// The record was never processed, because the service stopped or the drainer in
    /// charge of it is gone.
    #[error("record was abandoned before being processed")]
    Abandoned,
}

impl ProcessingError {
    pub fn checksum(cause: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Checksum(Arc::new(cause.into()))
    }

    pub fn failed(cause: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Failed(Arc::new(cause.into()))
    }

    pub fn unrecoverable(cause: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Unrecoverable(Arc::new(cause.into()))
    }

    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = panic.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = panic.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        ProcessingError::unrecoverable(anyhow::anyhow!(
            "panicked while processing record: {message}"
        ))
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProcessingError::Checksum(_) | ProcessingError::Failed(_)
        )
    }

    /// Label used when reporting the failure as a metric.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Checksum(_) => "checksum",
            ProcessingError::Failed(_) => "failed",
            ProcessingError::Unrecoverable(_) => "unrecoverable",
            ProcessingError::Abandoned => "abandoned",
        }
    }
}

/// Persists and validates the records of the topic partitions it is subscribed to.
///
/// Records are handed to [`ProcessingDelegate::process`] by a single drainer thread per
/// topic partition, in the order they were enqueued.
pub trait ProcessingDelegate: Send + Sync + 'static {
    fn process(
        &self,
        record: &ConsumerRecord,
        produced_record: Option<&dyn ProducedRecord>,
    ) -> Result<(), ProcessingError>;

    /// Consumption state of `partition`, if the delegate is still subscribed to it.
    fn partition_consumption_state(
        &self,
        _partition: i32,
    ) -> Option<Arc<dyn PartitionConsumptionState>> {
        None
    }

    /// Called with every recoverable failure raised by [`ProcessingDelegate::process`].
    fn set_last_drainer_error(&self, _error: &ProcessingError) {}

    fn record_checksum_verification_failure(&self) {}
}

/// Subscription state of a partition, owned by the consuming side.
pub trait PartitionConsumptionState: Send + Sync {
    /// Replaces the future of the most recently queued record of this partition. Once it
    /// resolves, every record queued before it has been processed too.
    fn set_last_queued_record_persisted_future(&self, future: RecordPersistedFuture);
}
