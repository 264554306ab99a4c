// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Downstream consumer of closed batches.

use crate::parser::Record;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// Errors returned by a [`BatchSink`]. Either way every message of the batch
/// is nacked; the broker is responsible for redelivery.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer refused the batch.
    #[error("batch rejected: {reason}")]
    Rejected {
        /// Why the batch was refused.
        reason: String,
    },
    /// The consumer could not be reached.
    #[error("sink unavailable: {reason}")]
    Unavailable {
        /// Underlying failure.
        reason: String,
    },
    /// The consumer panicked while processing the batch.
    #[error("sink panicked: {details}")]
    Panicked {
        /// Panic payload, when it is a string.
        details: String,
    },
}

impl SinkError {
    /// Builds a [`SinkError::Panicked`] from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let details = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self::Panicked { details }
    }
}

/// Receives each closed batch in a single call.
#[async_trait]
pub trait BatchSink<R: Send + 'static>: Send + Sync + 'static {
    /// Delivers the records of one batch. `records` may be empty when every
    /// message of the batch parsed to nothing.
    async fn deliver(&self, records: Vec<R>) -> Result<(), SinkError>;
}

#[async_trait]
impl<R, S> BatchSink<R> for Arc<S>
where
    R: Send + 'static,
    S: BatchSink<R> + ?Sized,
{
    async fn deliver(&self, records: Vec<R>) -> Result<(), SinkError> {
        (**self).deliver(records).await
    }
}

/// Logs every batch at `info` and accepts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl BatchSink<Record> for LoggingSink {
    async fn deliver(&self, records: Vec<Record>) -> Result<(), SinkError> {
        let messages = records
            .iter()
            .map(|r| &r.message_id)
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        tracing::info!(records = records.len(), messages, "batch received");
        for record in &records {
            tracing::debug!(
                message_id = %record.message_id,
                index = record.index,
                value = %record.value,
                "record"
            );
        }
        Ok(())
    }
}
