// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Optional to have but adds description/help message to the metrics emitted to
/// the metrics' sink.
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const STORE_BUFFER_ENQUEUED: &str = "store_buffer.records.enqueued.total";
pub const STORE_BUFFER_PROCESSED: &str = "store_buffer.records.processed.total";
pub const STORE_BUFFER_FAILED: &str = "store_buffer.records.failed.total";
pub const STORE_BUFFER_ABANDONED: &str = "store_buffer.records.abandoned.total";
pub const STORE_BUFFER_CHECKSUM_FAILURES: &str = "store_buffer.checksum_failures.total";
pub const STORE_BUFFER_PROCESSING_DURATION: &str = "store_buffer.processing_duration.seconds";
pub const STORE_BUFFER_DRAINER_FAILURES: &str = "store_buffer.drainer.failures.total";
pub const STORE_BUFFER_MEMORY_USAGE: &str = "store_buffer.memory_usage.bytes";

pub(crate) fn describe_metrics() {
    describe_counter!(
        STORE_BUFFER_ENQUEUED,
        Unit::Count,
        "Number of records put into the drainer queues"
    );

    describe_counter!(
        STORE_BUFFER_PROCESSED,
        Unit::Count,
        "Number of records successfully processed by the drainers"
    );

    describe_counter!(
        STORE_BUFFER_FAILED,
        Unit::Count,
        "Number of records whose processing failed, by failure kind"
    );

    describe_counter!(
        STORE_BUFFER_ABANDONED,
        Unit::Count,
        "Number of records dropped without being processed"
    );

    describe_counter!(
        STORE_BUFFER_CHECKSUM_FAILURES,
        Unit::Count,
        "Number of records failing checksum verification"
    );

    describe_histogram!(
        STORE_BUFFER_PROCESSING_DURATION,
        Unit::Seconds,
        "Time taken by the processing delegate for a single record"
    );

    describe_counter!(
        STORE_BUFFER_DRAINER_FAILURES,
        Unit::Count,
        "Number of drainers stopped by an unrecoverable fault"
    );

    describe_gauge!(
        STORE_BUFFER_MEMORY_USAGE,
        Unit::Bytes,
        "Memory accounted to the records buffered by a drainer"
    );
}
