// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use bytesize::ByteSize;
use futures::executor::block_on;
use googletest::prelude::*;
use parking_lot::Mutex;
use test_log::test;

use store_buffer::{
    ConsumerRecord, PartitionConsumptionState, ProcessingDelegate, ProcessingError,
    RecordPersistedFuture, StoreBufferOptionsBuilder, StoreBufferService, TopicPartition,
};

/// Persists records into an in-memory table, remembering the last persisted offset of each
/// partition.
#[derive(Default)]
struct InMemoryStore {
    table: Mutex<BTreeMap<Bytes, Bytes>>,
    offsets: Mutex<BTreeMap<TopicPartition, i64>>,
    out_of_order: Mutex<Vec<(TopicPartition, i64)>>,
    partitions: Mutex<BTreeMap<i32, Arc<Subscription>>>,
}

#[derive(Default)]
struct Subscription {
    last_queued: Mutex<Option<RecordPersistedFuture>>,
}

impl PartitionConsumptionState for Subscription {
    fn set_last_queued_record_persisted_future(&self, future: RecordPersistedFuture) {
        *self.last_queued.lock() = Some(future);
    }
}

impl InMemoryStore {
    fn subscribe(&self, partition: i32) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription::default());
        self.partitions
            .lock()
            .insert(partition, Arc::clone(&subscription));
        subscription
    }

    fn last_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .lock()
            .get(&TopicPartition::new(topic, partition))
            .copied()
    }
}

impl ProcessingDelegate for InMemoryStore {
    fn process(
        &self,
        record: &ConsumerRecord,
        _produced_record: Option<&dyn store_buffer::ProducedRecord>,
    ) -> std::result::Result<(), ProcessingError> {
        let mut offsets = self.offsets.lock();
        let last = offsets
            .entry(record.topic_partition().clone())
            .or_insert(-1);
        if record.offset() != *last + 1 {
            self.out_of_order
                .lock()
                .push((record.topic_partition().clone(), record.offset()));
        }
        *last = record.offset();
        drop(offsets);

        match record.value() {
            Some(value) => self.table.lock().insert(record.key().clone(), value.clone()),
            None => self.table.lock().remove(record.key()),
        };
        Ok(())
    }

    fn partition_consumption_state(
        &self,
        partition: i32,
    ) -> Option<Arc<dyn PartitionConsumptionState>> {
        self.partitions
            .lock()
            .get(&partition)
            .map(|subscription| Arc::clone(subscription) as Arc<dyn PartitionConsumptionState>)
    }
}

fn service(drainers: usize, capacity: ByteSize) -> StoreBufferService {
    let options = StoreBufferOptionsBuilder::default()
        .drainer_count(NonZeroUsize::new(drainers).unwrap())
        .buffer_capacity_per_drainer(capacity)
        .buffer_notify_delta(ByteSize::b(512))
        .drain_poll_interval(Duration::from_millis(2).into())
        .build()
        .unwrap();
    let service = StoreBufferService::new(options).unwrap();
    service.start().unwrap();
    service
}

fn put(topic: &str, partition: i32, offset: i64) -> ConsumerRecord {
    ConsumerRecord::new(
        TopicPartition::new(topic, partition),
        offset,
        Bytes::from(format!("{topic}-{partition}-{}", offset % 16)),
        Some(Bytes::from(offset.to_string())),
    )
}

#[test]
fn concurrent_ingestion_keeps_partitions_in_order() {
    // small buffers so that the polling threads are throttled
    let service = Arc::new(service(4, ByteSize::kib(4)));
    let store = Arc::new(InMemoryStore::default());

    let pollers: Vec<_> = ["orders", "payments"]
        .into_iter()
        .map(|topic| {
            let service = Arc::clone(&service);
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for offset in 0..500 {
                    for partition in 0..6 {
                        service
                            .enqueue(put(topic, partition, offset), store.clone(), None)
                            .unwrap();
                    }
                }
            })
        })
        .collect();
    for poller in pollers {
        poller.join().unwrap();
    }

    for topic in ["orders", "payments"] {
        for partition in 0..6 {
            service.drain_partition(topic, partition).unwrap();
            assert_that!(store.last_offset(topic, partition), some(eq(499)));
        }
    }
    assert!(store.out_of_order.lock().is_empty());
    assert_that!(service.total_memory_usage(), eq(0));
    assert!(service.check_health().is_ok());
}

#[test]
fn resubscription_waits_for_the_previous_subscription() {
    let service = service(2, ByteSize::mib(1));
    let store = Arc::new(InMemoryStore::default());
    let subscription = store.subscribe(3);

    for offset in 0..100 {
        service
            .enqueue(put("users", 3, offset), store.clone(), None)
            .unwrap();
    }

    // unsubscribe, then make sure nothing of the old subscription is still pending
    service.drain_partition("users", 3).unwrap();
    assert_that!(store.last_offset("users", 3), some(eq(99)));
    let last_queued = subscription.last_queued.lock().clone().unwrap();
    assert!(last_queued.is_completed());
    assert!(block_on(last_queued).is_ok());

    let resubscription = store.subscribe(3);
    for offset in 100..150 {
        service
            .enqueue(put("users", 3, offset), store.clone(), None)
            .unwrap();
    }
    let last_queued = resubscription.last_queued.lock().clone().unwrap();
    assert!(block_on(last_queued).is_ok());
    assert_that!(store.last_offset("users", 3), some(eq(149)));
    assert!(store.out_of_order.lock().is_empty());

    // tombstones remove the key
    service
        .enqueue(
            ConsumerRecord::new(
                TopicPartition::new("users", 3),
                150,
                Bytes::from_static(b"users-3-6"),
                None,
            ),
            store.clone(),
            None,
        )
        .unwrap();
    service.drain_partition("users", 3).unwrap();
    assert!(!store.table.lock().contains_key(b"users-3-6".as_slice()));
}

#[test]
fn stopping_an_idle_service_is_harmless() {
    let service = service(3, ByteSize::kib(64));
    service.stop();
    service.stop();

    let store = Arc::new(InMemoryStore::default());
    assert!(
        service
            .enqueue(put("users", 0, 0), store.clone(), None)
            .is_err()
    );
    assert!(store.offsets.lock().is_empty());
}
