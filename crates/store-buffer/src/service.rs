// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::completion::{Completion, ProducedRecord};
use crate::delegate::ProcessingDelegate;
use crate::drainer::{Drainer, DrainerStatus, QueueNode};
use crate::error::BufferError;
use crate::metric_definitions::{
    STORE_BUFFER_ENQUEUED, STORE_BUFFER_MEMORY_USAGE, describe_metrics,
};
use crate::options::StoreBufferOptions;
use crate::queue::{MemoryBoundQueue, PutError};
use crate::record::{ConsumerRecord, TopicPartition};
use crate::routing;

/// Drainers whose buffer is filled above this percentage of its capacity are
/// considered slow.
const SLOW_DRAINER_THRESHOLD_PERCENT: u128 = 80;
const SLOW_DRAINER_REPORTED_PARTITIONS: usize = 5;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Lifecycle {
    Created,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// Buffers records polled from the upstream log in front of a fixed pool of drainer
/// threads that hand them to their [`ProcessingDelegate`].
///
/// 1. There is a fixed number of drainers, each one owning a queue bounded by the memory
///    of the records it buffers.
/// 2. All the records of a topic partition are assigned to the same drainer (see
///    [`routing::drainer_index`]), hence they are processed in the order they were
///    enqueued.
/// 3. Enqueuing blocks while the queue of the target drainer is full, which slows the
///    polling thread down to the pace of the slowest drainer it feeds.
///
/// All methods take `&self`, so the service can be shared between the polling thread and
/// the code managing subscriptions.
pub struct StoreBufferService {
    options: StoreBufferOptions,
    drainers: Vec<Arc<Drainer>>,
    lifecycle: Mutex<Lifecycle>,
}

impl StoreBufferService {
    pub fn new(options: StoreBufferOptions) -> Result<Self, BufferError> {
        options.validate()?;
        describe_metrics();

        let drainers = (0..options.drainer_count.get())
            .map(|index| {
                let queue = Arc::new(MemoryBoundQueue::new(
                    options.capacity_per_drainer(),
                    options.notify_delta(),
                ));
                Arc::new(Drainer::new(index, queue))
            })
            .collect();

        Ok(Self {
            options,
            drainers,
            lifecycle: Mutex::new(Lifecycle::Created),
        })
    }

    pub fn options(&self) -> &StoreBufferOptions {
        &self.options
    }

    /// Spawns one thread per drainer. The pool cannot be resized afterwards.
    pub fn start(&self) -> Result<(), BufferError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Err(BufferError::AlreadyStarted),
            Lifecycle::Stopped => return Err(BufferError::ShuttingDown),
        }

        let mut workers = Vec::with_capacity(self.drainers.len());
        for drainer in &self.drainers {
            let index = drainer.index();
            let worker = {
                let drainer = Arc::clone(drainer);
                thread::Builder::new()
                    .name(format!("store-writer-{index}"))
                    .spawn(move || drainer.run())
            };
            match worker {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    *lifecycle = Lifecycle::Running(workers);
                    drop(lifecycle);
                    self.stop();
                    return Err(BufferError::Spawn { index, source });
                }
            }
        }

        info!(
            drainers = workers.len(),
            capacity_per_drainer = %self.options.buffer_capacity_per_drainer,
            "Started store buffer service"
        );
        *lifecycle = Lifecycle::Running(workers);
        Ok(())
    }

    /// Stops all drainers and waits up to the configured shutdown timeout for their threads
    /// to exit. Records still buffered are completed as abandoned; a record being processed
    /// while the timeout expires is left to its thread, which is detached.
    ///
    /// Calling it more than once has no effect.
    pub fn stop(&self) {
        let workers = match std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped) {
            Lifecycle::Running(workers) => workers,
            Lifecycle::Created => Vec::new(),
            Lifecycle::Stopped => return,
        };
        info!("Stopping store buffer service");

        for drainer in &self.drainers {
            drainer.stop();
            drainer.queue().close();
        }

        let deadline = Instant::now() + self.options.shutdown_timeout();
        while workers.iter().any(|worker| !worker.is_finished()) && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }

        for (index, worker) in workers.into_iter().enumerate() {
            if !worker.is_finished() {
                warn!(
                    drainer = index,
                    timeout = ?self.options.shutdown_timeout(),
                    "Drainer did not stop in time, detaching its thread"
                );
                continue;
            }
            if worker.join().is_err() {
                error!(drainer = index, "Drainer thread panicked");
            }
        }

        let mut abandoned = 0;
        for drainer in &self.drainers {
            for node in drainer.queue().drain_remaining() {
                node.abandon();
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "Abandoned records still buffered at shutdown");
        }
        info!("Store buffer service stopped");
    }

    /// Buffers `record` in the queue of the drainer in charge of its topic partition,
    /// blocking while that queue is full.
    ///
    /// The outcome of processing is reported to `produced_record` if given. Otherwise a
    /// [`RecordPersistedFuture`](crate::RecordPersistedFuture) is created and handed to the
    /// consumption state of the partition as its last queued record.
    ///
    /// Fails without buffering the record if the record can never fit into a queue, the
    /// drainer is dead, or the service is stopping; the record's completion is resolved as
    /// abandoned in that case.
    pub fn enqueue(
        &self,
        record: ConsumerRecord,
        delegate: Arc<dyn ProcessingDelegate>,
        produced_record: Option<Arc<dyn ProducedRecord>>,
    ) -> Result<(), BufferError> {
        let index = self.drainer_index(record.topic(), record.partition());
        let partition = record.partition();

        let (completion, persisted_future) = match produced_record {
            Some(produced_record) => (Completion::for_produced_record(produced_record), None),
            None => {
                let (completion, future) = Completion::with_future();
                (completion, Some(future))
            }
        };

        let drainer = &self.drainers[index];
        let node = QueueNode::new(record, Arc::clone(&delegate), completion);
        if let Err(err) = drainer.queue().put(node) {
            return Err(match err {
                PutError::TooLarge { entry, size } => {
                    entry.abandon();
                    BufferError::RecordTooLarge {
                        index,
                        size: ByteSize::b(size as u64),
                        capacity: self.options.buffer_capacity_per_drainer,
                    }
                }
                PutError::Closed(entry) => {
                    entry.abandon();
                    if matches!(*self.lifecycle.lock(), Lifecycle::Stopped) {
                        BufferError::ShuttingDown
                    } else {
                        BufferError::DrainerFailed { index }
                    }
                }
            });
        }
        counter!(STORE_BUFFER_ENQUEUED).increment(1);

        if let Some(future) = persisted_future {
            if let Some(state) = delegate.partition_consumption_state(partition) {
                state.set_last_queued_record_persisted_future(future);
            }
        }
        Ok(())
    }

    /// Blocks until no record of `topic`/`partition` is buffered or being processed, using
    /// the configured retries and poll interval.
    ///
    /// Used before resubscribing to a partition, so that records of the old and the new
    /// subscription never overlap.
    pub fn drain_partition(&self, topic: &str, partition: i32) -> Result<(), BufferError> {
        self.drain_partition_with(
            topic,
            partition,
            self.options.drain_retries,
            self.options.drain_poll_interval(),
        )
    }

    pub fn drain_partition_with(
        &self,
        topic: &str,
        partition: i32,
        retries: usize,
        poll_interval: Duration,
    ) -> Result<(), BufferError> {
        let index = self.drainer_index(topic, partition);
        let drainer = &self.drainers[index];
        let topic_partition = TopicPartition::new(topic, partition);

        for _ in 0..retries {
            if drainer.status() == DrainerStatus::Failed {
                error!(
                    drainer = index,
                    topic, partition, "Cannot drain partition, its drainer has failed"
                );
                return Err(BufferError::DrainerFailed { index });
            }
            if !drainer.queue().contains_pending(&topic_partition) {
                info!(
                    drainer = index,
                    topic,
                    partition,
                    "The queue of drainer doesn't contain any record for partition"
                );
                return Ok(());
            }
            thread::sleep(poll_interval);
        }

        let err = BufferError::DrainTimeout {
            index,
            topic: topic.to_owned(),
            partition,
            retries,
        };
        error!(%err, "Failed draining partition");
        Err(err)
    }

    pub fn drainer_index(&self, topic: &str, partition: i32) -> usize {
        routing::drainer_index(topic, partition, self.options.drainer_count)
    }

    pub fn drainer_count(&self) -> usize {
        self.drainers.len()
    }

    pub fn drainer_status(&self, index: usize) -> Option<DrainerStatus> {
        self.drainers.get(index).map(|drainer| drainer.status())
    }

    pub fn watch_drainer_status(&self, index: usize) -> Option<watch::Receiver<DrainerStatus>> {
        self.drainers.get(index).map(|drainer| drainer.watch_status())
    }

    /// Fails if any drainer stopped after an unrecoverable fault.
    pub fn check_health(&self) -> Result<(), BufferError> {
        match self
            .drainers
            .iter()
            .find(|drainer| drainer.status() == DrainerStatus::Failed)
        {
            Some(drainer) => Err(BufferError::DrainerFailed {
                index: drainer.index(),
            }),
            None => Ok(()),
        }
    }

    pub fn drainer_queue_memory_usage(&self, index: usize) -> Option<usize> {
        self.drainers
            .get(index)
            .map(|drainer| drainer.queue().memory_usage())
    }

    pub fn total_memory_usage(&self) -> usize {
        self.drainers
            .iter()
            .map(|drainer| drainer.queue().memory_usage())
            .sum()
    }

    pub fn total_remaining_memory(&self) -> usize {
        self.drainers
            .iter()
            .map(|drainer| drainer.queue().remaining_capacity())
            .sum()
    }

    pub fn min_memory_usage_per_drainer(&self) -> usize {
        self.drainers
            .iter()
            .map(|drainer| drainer.queue().memory_usage())
            .min()
            .unwrap_or_default()
    }

    /// Largest memory usage among the drainer queues.
    ///
    /// If any queue is filled above 80% of its capacity, the partitions every drainer spent
    /// the most time on are logged. The per partition processing time is reset by every
    /// call.
    pub fn max_memory_usage_per_drainer(&self) -> usize {
        let capacity = self.options.capacity_per_drainer() as u128;
        let is_slow =
            |usage: usize| usage as u128 * 100 > capacity * SLOW_DRAINER_THRESHOLD_PERCENT;

        let usages: Vec<usize> = self
            .drainers
            .iter()
            .map(|drainer| drainer.queue().memory_usage())
            .collect();
        let slow_drainer_exists = usages.iter().any(|usage| is_slow(*usage));

        for (drainer, usage) in self.drainers.iter().zip(usages.iter().copied()) {
            gauge!(STORE_BUFFER_MEMORY_USAGE, "drainer" => drainer.index().to_string())
                .set(usage as f64);

            if slow_drainer_exists {
                let count = if is_slow(usage) {
                    SLOW_DRAINER_REPORTED_PARTITIONS
                } else {
                    1
                };
                for (topic_partition, spent) in drainer.slowest_partitions(count) {
                    info!(
                        drainer = drainer.index(),
                        topic = topic_partition.topic(),
                        partition = topic_partition.partition(),
                        time_spent_ms = spent.as_millis() as u64,
                        "Time spent on partition"
                    );
                }
                info!(
                    drainer = drainer.index(),
                    partitions = drainer.time_spent().len(),
                    memory_usage = usage,
                    "Drainer is hosting partitions"
                );
            }
            drainer.clear_time_spent();
        }

        usages.into_iter().max().unwrap_or_default()
    }

    /// Processing time per topic partition accumulated by drainer `index` since the last
    /// call to [`Self::max_memory_usage_per_drainer`], slowest first.
    pub fn topic_partition_time_spent(&self, index: usize) -> Vec<(TopicPartition, Duration)> {
        self.drainers
            .get(index)
            .map(|drainer| drainer.slowest_partitions(usize::MAX))
            .unwrap_or_default()
    }
}

impl Drop for StoreBufferService {
    fn drop(&mut self) {
        self.stop();
    }
}
