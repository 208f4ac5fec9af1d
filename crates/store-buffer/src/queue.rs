// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Blocking FIFO queue bounded by the accounted byte size of its entries.
//!
//! Producers block in [`MemoryBoundQueue::put`] while the entry does not fit and the
//! single consumer blocks in [`MemoryBoundQueue::take`] while the queue is empty.
//! Closing the queue wakes everybody up; blocked and subsequent calls return an error
//! instead of waiting.
//!
//! Producers waiting for space are only woken once at least `notify_delta` bytes are
//! free again (or the queue has been emptied), which avoids waking them for every
//! single entry the consumer removes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::record::TopicPartition;

/// An entry that can be buffered in a [`MemoryBoundQueue`].
pub trait QueueEntry {
    /// Accounted size of the entry while it is buffered.
    fn size_in_bytes(&self) -> usize;

    /// The topic partition the entry belongs to; used by membership queries.
    fn topic_partition(&self) -> &TopicPartition;
}

/// The queue has been closed; no entry was inserted or taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is closed")]
pub struct QueueClosed;

/// Reasons for [`MemoryBoundQueue::put`] to give the entry back to the caller.
#[derive(Debug)]
pub enum PutError<T> {
    Closed(T),
    /// The entry is larger than the whole capacity of the queue and can never fit.
    TooLarge { entry: T, size: usize },
}

impl<T> PutError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PutError::Closed(entry) | PutError::TooLarge { entry, .. } => entry,
        }
    }
}

#[derive(Debug)]
struct State<T> {
    entries: VecDeque<T>,
    /// Key of the entry handed out by the last `take` until the consumer calls
    /// `finish_in_flight`.
    in_flight: Option<TopicPartition>,
    closed: bool,
}

#[derive(Debug)]
pub struct MemoryBoundQueue<T> {
    capacity: usize,
    notify_delta: usize,
    /// Only modified while holding the state lock, read without it.
    used: AtomicUsize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T: QueueEntry> MemoryBoundQueue<T> {
    /// `notify_delta` is clamped to `capacity`.
    pub fn new(capacity: usize, notify_delta: usize) -> Self {
        Self {
            capacity,
            notify_delta: notify_delta.min(capacity),
            used: AtomicUsize::new(0),
            state: Mutex::new(State {
                entries: VecDeque::new(),
                in_flight: None,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn notify_delta(&self) -> usize {
        self.notify_delta
    }

    /// Appends `entry`, blocking until it fits into the remaining capacity.
    ///
    /// Fails without inserting if the queue is (or gets) closed while waiting, or if
    /// the entry is larger than the whole capacity.
    pub fn put(&self, entry: T) -> Result<(), PutError<T>> {
        let size = entry.size_in_bytes();
        if size > self.capacity {
            return Err(PutError::TooLarge { entry, size });
        }

        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PutError::Closed(entry));
            }
            if self.used.load(Ordering::Relaxed) + size <= self.capacity {
                break;
            }
            self.not_full.wait(&mut state);
        }

        self.used.fetch_add(size, Ordering::Relaxed);
        state.entries.push_back(entry);
        drop(state);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the head of the queue, blocking while the queue is empty.
    ///
    /// The key of the returned entry stays visible to [`Self::contains_pending`] until
    /// [`Self::finish_in_flight`] is called or the next entry is taken.
    pub fn take(&self) -> Result<T, QueueClosed> {
        let mut state = self.state.lock();
        let entry = loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if let Some(entry) = state.entries.pop_front() {
                break entry;
            }
            self.not_empty.wait(&mut state);
        };

        let used = self.used.fetch_sub(entry.size_in_bytes(), Ordering::Relaxed)
            - entry.size_in_bytes();
        state.in_flight = Some(entry.topic_partition().clone());
        let wake_producers =
            state.entries.is_empty() || self.capacity - used >= self.notify_delta;
        drop(state);

        if wake_producers {
            self.not_full.notify_all();
        }
        Ok(entry)
    }

    /// Marks the entry returned by the last [`Self::take`] as completely handled.
    pub fn finish_in_flight(&self) {
        self.state.lock().in_flight = None;
    }

    /// Whether an entry of `topic_partition` is currently queued.
    ///
    /// Linear in the queue length; not meant for the hot path.
    pub fn contains(&self, topic_partition: &TopicPartition) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .any(|entry| entry.topic_partition() == topic_partition)
    }

    /// Like [`Self::contains`], but also considers the entry the consumer is working on.
    pub fn contains_pending(&self, topic_partition: &TopicPartition) -> bool {
        let state = self.state.lock();
        state.in_flight.as_ref() == Some(topic_partition)
            || state
                .entries
                .iter()
                .any(|entry| entry.topic_partition() == topic_partition)
    }

    /// Closes the queue and wakes up all blocked producers and the consumer.
    ///
    /// Queued entries are kept until [`Self::drain_remaining`] is called.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Removes and returns all queued entries, releasing their memory.
    pub fn drain_remaining(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let drained: Vec<T> = state.entries.drain(..).collect();
        self.used.store(0, Ordering::Relaxed);
        drop(state);
        self.not_full.notify_all();
        drained
    }

    /// Bytes accounted to the currently queued entries.
    pub fn memory_usage(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.memory_usage())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
