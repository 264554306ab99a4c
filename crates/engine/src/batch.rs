// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Worker-owned batch accumulation.

use crate::handoff::WorkItem;
use crate::message::{NackCause, Outcome};
use std::time::Duration;
use tokio::time::Instant;

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The batch reached the maximum batch size.
    Full,
    /// The wait deadline elapsed with at least one message accumulated.
    Timeout,
    /// The pipeline is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A batch accepting messages. Its size is the number of messages, not records.
pub(crate) struct OpenBatch<R> {
    records: Vec<R>,
    items: Vec<WorkItem>,
    deadline: Instant,
}

impl<R> OpenBatch<R> {
    /// Opens a batch whose deadline starts now.
    pub(crate) fn open(max_wait_time: Duration) -> Self {
        Self {
            records: Vec::new(),
            items: Vec::new(),
            deadline: Instant::now() + max_wait_time,
        }
    }

    pub(crate) fn push(&mut self, item: WorkItem, records: Vec<R>) {
        self.records.extend(records);
        self.items.push(item);
    }

    pub(crate) fn size(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn close(self, reason: CloseReason) -> ClosedBatch<R> {
        ClosedBatch {
            records: self.records,
            items: self.items,
            reason,
        }
    }
}

/// An immutable batch waiting for its delivery outcome.
pub(crate) struct ClosedBatch<R> {
    records: Vec<R>,
    items: Vec<WorkItem>,
    reason: CloseReason,
}

impl<R> ClosedBatch<R> {
    pub(crate) fn reason(&self) -> CloseReason {
        self.reason
    }

    pub(crate) fn size(&self) -> usize {
        self.items.len()
    }

    /// Splits the batch into the records to deliver and a settlement handle.
    pub(crate) fn into_parts(self) -> (Vec<R>, Settlement) {
        (self.records, Settlement { items: self.items })
    }
}

/// The messages of a delivered batch, settled all together.
pub(crate) struct Settlement {
    items: Vec<WorkItem>,
}

impl Settlement {
    pub(crate) fn ack_all(self) {
        for item in self.items {
            item.ack();
        }
    }

    pub(crate) fn nack_all(self, reason: &str) {
        for item in self.items {
            item.resolve(Outcome::nack(NackCause::BatchRejected, reason));
        }
    }
}
