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
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

use crate::delegate::ProcessingError;

/// A write to the downstream log that depends on a buffered record.
///
/// The buffer does not look into it, it only reports when the record it belongs to has
/// been persisted (or failed).
pub trait ProducedRecord: Send + Sync {
    /// Invoked exactly once, after the record has been processed.
    fn complete_persisted(&self, result: Result<(), ProcessingError>);
}

type PersistedResult = Result<(), ProcessingError>;

/// Resolves once the buffered record it was created for has been processed.
///
/// Cheaply cloneable; all clones resolve to the same result. Resolves with
/// [`ProcessingError::Abandoned`] if the record is dropped without being processed.
#[derive(Clone)]
pub struct RecordPersistedFuture {
    rx: Shared<oneshot::Receiver<PersistedResult>>,
}

impl RecordPersistedFuture {
    /// Result of the record if it was already processed. Never blocks.
    pub fn peek(&self) -> Option<PersistedResult> {
        self.rx
            .clone()
            .now_or_never()
            .map(|result| Self::flatten(&result))
    }

    pub fn is_completed(&self) -> bool {
        self.peek().is_some()
    }

    fn flatten(result: &Result<PersistedResult, oneshot::error::RecvError>) -> PersistedResult {
        match result {
            Ok(result) => result.clone(),
            Err(_) => Err(ProcessingError::Abandoned),
        }
    }
}

impl fmt::Debug for RecordPersistedFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordPersistedFuture")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Future for RecordPersistedFuture {
    type Output = PersistedResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(self.rx.poll_unpin(cx));
        Poll::Ready(Self::flatten(&result))
    }
}

/// How the outcome of a buffered record is reported. Every record carries exactly one.
pub(crate) enum Completion {
    Produced(Arc<dyn ProducedRecord>),
    Future(oneshot::Sender<PersistedResult>),
}

impl Completion {
    pub(crate) fn for_produced_record(produced_record: Arc<dyn ProducedRecord>) -> Self {
        Completion::Produced(produced_record)
    }

    pub(crate) fn with_future() -> (Self, RecordPersistedFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Completion::Future(tx),
            RecordPersistedFuture { rx: rx.shared() },
        )
    }

    pub(crate) fn produced_record(&self) -> Option<&dyn ProducedRecord> {
        match self {
            Completion::Produced(produced_record) => Some(produced_record.as_ref()),
            Completion::Future(_) => None,
        }
    }

    pub(crate) fn complete(self, result: PersistedResult) {
        match self {
            Completion::Produced(produced_record) => produced_record.complete_persisted(result),
            Completion::Future(tx) => {
                // we don't care if the receiver is dropped
                let _ = tx.send(result);
            }
        }
    }
}
