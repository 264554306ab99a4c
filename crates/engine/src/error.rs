// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors that stop or prevent the start of a pipeline.

use crate::subscriber::SubscriberError;

/// Errors that stop (or prevent the start of) a pipeline.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The source configuration failed validation; nothing was started.
    #[error(transparent)]
    InvalidConfig(#[from] subflow_config::Error),
    /// A subscriber connection could not be built or started.
    #[error("failed to start subscriber connection {connection}: {source}")]
    SubscriberStart {
        /// Index of the connection that failed.
        connection: usize,
        /// Underlying subscriber error.
        #[source]
        source: SubscriberError,
    },
    /// A running subscriber connection entered a failed state.
    #[error("subscriber connection {connection} failed: {reason}")]
    SubscriberFailed {
        /// Index of the failed connection.
        connection: usize,
        /// Failure reported by the broker client.
        reason: String,
    },
}
