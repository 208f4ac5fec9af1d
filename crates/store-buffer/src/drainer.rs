// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::completion::Completion;
use crate::delegate::{ProcessingDelegate, ProcessingError};
use crate::metric_definitions::{
    STORE_BUFFER_ABANDONED, STORE_BUFFER_CHECKSUM_FAILURES, STORE_BUFFER_DRAINER_FAILURES,
    STORE_BUFFER_FAILED, STORE_BUFFER_PROCESSED, STORE_BUFFER_PROCESSING_DURATION,
};
use crate::queue::{MemoryBoundQueue, QueueClosed, QueueEntry};
use crate::record::{ConsumerRecord, TopicPartition};

/// A record waiting in a drainer queue together with whoever processes it and
/// whoever waits for it.
pub(crate) struct QueueNode {
    record: ConsumerRecord,
    delegate: Arc<dyn ProcessingDelegate>,
    completion: Completion,
}

impl QueueNode {
    pub(crate) fn new(
        record: ConsumerRecord,
        delegate: Arc<dyn ProcessingDelegate>,
        completion: Completion,
    ) -> Self {
        Self {
            record,
            delegate,
            completion,
        }
    }

    /// Resolves the completion of a record that will never be processed.
    pub(crate) fn abandon(self) {
        counter!(STORE_BUFFER_ABANDONED).increment(1);
        self.completion.complete(Err(ProcessingError::Abandoned));
    }
}

impl QueueEntry for QueueNode {
    fn size_in_bytes(&self) -> usize {
        self.record.buffered_size()
    }

    fn topic_partition(&self) -> &TopicPartition {
        self.record.topic_partition()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DrainerStatus {
    /// Created, but its thread was not started yet.
    Idle,
    Running,
    /// Exited after being asked to stop.
    Stopped,
    /// Exited on its own after an unrecoverable fault; its queue is no longer drained.
    Failed,
}

/// Worker draining a single [`MemoryBoundQueue`] on a dedicated thread.
///
/// Records are processed one at a time in queue order. A record failing with a
/// recoverable error only fails that record, anything else ends the drainer.
pub(crate) struct Drainer {
    index: usize,
    queue: Arc<MemoryBoundQueue<QueueNode>>,
    running: AtomicBool,
    status: watch::Sender<DrainerStatus>,
    /// Processing time per topic partition since the last telemetry snapshot.
    time_spent: DashMap<TopicPartition, Duration>,
}

impl Drainer {
    pub(crate) fn new(index: usize, queue: Arc<MemoryBoundQueue<QueueNode>>) -> Self {
        Self {
            index,
            queue,
            running: AtomicBool::new(true),
            status: watch::Sender::new(DrainerStatus::Idle),
            time_spent: DashMap::new(),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn queue(&self) -> &MemoryBoundQueue<QueueNode> {
        &self.queue
    }

    pub(crate) fn status(&self) -> DrainerStatus {
        *self.status.borrow()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<DrainerStatus> {
        self.status.subscribe()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Asks the drainer to exit; it does so once its current record is processed, or
    /// when it observes its queue being closed.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn time_spent(&self) -> &DashMap<TopicPartition, Duration> {
        &self.time_spent
    }

    /// Runs the drain loop on the calling thread until the drainer is stopped or fails.
    pub(crate) fn run(&self) {
        info!(drainer = self.index, "Starting store buffer drainer");
        self.status.send_replace(DrainerStatus::Running);

        // AssertUnwindSafe is safe because the queue and the timing map are only shared
        // through their own locks
        let status = panic::catch_unwind(AssertUnwindSafe(|| self.drain())).unwrap_or_else(
            |panic| {
                let fault = ProcessingError::from_panic(panic);
                error!(
                    drainer = self.index,
                    %fault,
                    "Drainer panicked, its queue will not be drained anymore"
                );
                DrainerStatus::Failed
            },
        );

        if status == DrainerStatus::Failed {
            self.fail();
        } else {
            self.status.send_replace(status);
        }
        info!(drainer = self.index, %status, "Store buffer drainer exited");
    }

    /// Rejects producers and waiters of a drainer that is not going to drain its queue
    /// anymore.
    fn fail(&self) {
        counter!(STORE_BUFFER_DRAINER_FAILURES).increment(1);
        self.queue.close();
        self.queue.finish_in_flight();
        self.status.send_replace(DrainerStatus::Failed);

        let stranded = self.queue.drain_remaining();
        if !stranded.is_empty() {
            warn!(
                drainer = self.index,
                abandoned = stranded.len(),
                "Abandoning records queued behind the fault"
            );
        }
        for node in stranded {
            node.abandon();
        }
    }

    fn drain(&self) -> DrainerStatus {
        while self.is_running() {
            let node = match self.queue.take() {
                Ok(node) => node,
                Err(QueueClosed) if !self.is_running() => break,
                Err(QueueClosed) => {
                    error!(
                        drainer = self.index,
                        "Queue was closed while the drainer was not asked to stop, exiting"
                    );
                    return DrainerStatus::Failed;
                }
            };

            if let Err(fault) = self.process(node) {
                error!(
                    drainer = self.index,
                    %fault,
                    "Drainer stops after an unrecoverable fault, its queue will not be drained anymore"
                );
                return DrainerStatus::Failed;
            }
        }
        DrainerStatus::Stopped
    }

    /// Processes a single record and resolves its completion.
    ///
    /// Only unrecoverable faults are returned; the record has already been completed
    /// with the fault when that happens.
    fn process(&self, node: QueueNode) -> Result<(), ProcessingError> {
        let QueueNode {
            record,
            delegate,
            completion,
        } = node;

        trace!(drainer = self.index, %record, "Processing buffered record");
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            delegate.process(&record, completion.produced_record())
        }))
        .unwrap_or_else(|panic| Err(ProcessingError::from_panic(panic)));
        let elapsed = start.elapsed();
        histogram!(STORE_BUFFER_PROCESSING_DURATION).record(elapsed);

        let outcome = match result {
            Ok(()) => {
                completion.complete(Ok(()));
                self.record_time_spent(record.topic_partition(), elapsed);
                counter!(STORE_BUFFER_PROCESSED).increment(1);
                Ok(())
            }
            Err(err) => {
                error!(
                    drainer = self.index,
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    %err,
                    "Got error during processing of record {record}"
                );
                counter!(STORE_BUFFER_FAILED, "kind" => err.kind()).increment(1);

                if err.is_recoverable() {
                    // resolve the record first, the hooks below must not prevent it
                    completion.complete(Err(err.clone()));
                    delegate.set_last_drainer_error(&err);
                    if matches!(err, ProcessingError::Checksum(_)) {
                        counter!(STORE_BUFFER_CHECKSUM_FAILURES).increment(1);
                        delegate.record_checksum_verification_failure();
                    }
                    Ok(())
                } else {
                    completion.complete(Err(err.clone()));
                    Err(err)
                }
            }
        };

        self.queue.finish_in_flight();
        outcome
    }

    fn record_time_spent(&self, topic_partition: &TopicPartition, elapsed: Duration) {
        if let Some(mut spent) = self.time_spent.get_mut(topic_partition) {
            *spent += elapsed;
            return;
        }
        *self
            .time_spent
            .entry(topic_partition.clone())
            .or_default() += elapsed;
    }

    /// The `count` topic partitions this drainer spent the most time on, slowest first.
    pub(crate) fn slowest_partitions(&self, count: usize) -> Vec<(TopicPartition, Duration)> {
        let mut entries: Vec<_> = self
            .time_spent
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_by(|(_, a), (_, b)| b.cmp(a));
        entries.truncate(count);
        entries
    }

    pub(crate) fn clear_time_spent(&self) {
        debug!(
            drainer = self.index,
            partitions = self.time_spent.len(),
            "Resetting per partition processing time"
        );
        self.time_spent.clear();
    }
}
