// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::error::OptionsError;

const DEFAULT_DRAINER_COUNT: NonZeroUsize = NonZeroUsize::new(8).unwrap();

/// # Store buffer options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct StoreBufferOptions {
    /// # Drainer count
    ///
    /// Number of drainer threads, each owning one buffer. All records of a topic partition
    /// are processed by the same drainer.
    pub drainer_count: NonZeroUsize,

    /// # Buffer capacity per drainer
    ///
    /// Memory that the records buffered for a single drainer may occupy. Producers block
    /// once it is reached.
    pub buffer_capacity_per_drainer: ByteSize,

    /// # Buffer notify delta
    ///
    /// Amount of free buffer space required before blocked producers are woken up.
    pub buffer_notify_delta: ByteSize,

    /// # Drain retries
    ///
    /// How many times draining a partition checks the buffer before giving up.
    pub drain_retries: usize,

    /// # Drain poll interval
    ///
    /// Pause between two checks while draining a partition.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub drain_poll_interval: humantime::Duration,

    /// # Shutdown timeout
    ///
    /// How long stopping the service waits for the drainer threads to exit.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub shutdown_timeout: humantime::Duration,
}

impl StoreBufferOptions {
    pub fn capacity_per_drainer(&self) -> usize {
        self.buffer_capacity_per_drainer.as_u64() as usize
    }

    pub fn notify_delta(&self) -> usize {
        self.buffer_notify_delta.as_u64() as usize
    }

    pub fn drain_poll_interval(&self) -> Duration {
        *self.drain_poll_interval
    }

    pub fn shutdown_timeout(&self) -> Duration {
        *self.shutdown_timeout
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.drainer_count.get() > i32::MAX as usize {
            return Err(OptionsError {
                name: "drainer-count",
                reason: "must not exceed 2147483647",
            });
        }
        if self.buffer_capacity_per_drainer.as_u64() == 0 {
            return Err(OptionsError {
                name: "buffer-capacity-per-drainer",
                reason: "must be greater than zero",
            });
        }
        if self.buffer_notify_delta > self.buffer_capacity_per_drainer {
            return Err(OptionsError {
                name: "buffer-notify-delta",
                reason: "must not exceed buffer-capacity-per-drainer",
            });
        }
        Ok(())
    }
}

impl Default for StoreBufferOptions {
    fn default() -> Self {
        Self {
            drainer_count: DEFAULT_DRAINER_COUNT,
            buffer_capacity_per_drainer: ByteSize::mib(125),
            buffer_notify_delta: ByteSize::mib(10),
            drain_retries: 1000,
            drain_poll_interval: Duration::from_millis(50).into(),
            shutdown_timeout: Duration::from_secs(10).into(),
        }
    }
}
