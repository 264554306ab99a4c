// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the controller crate.

/// Errors that can occur while running a pipeline under the controller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The Tokio runtime could not be created.
    #[error("failed to build the async runtime: {details}")]
    RuntimeError {
        /// Underlying I/O error message.
        details: String,
    },

    /// The pipeline failed to start or stopped on a fatal failure.
    #[error("pipeline error: {source}")]
    PipelineError {
        /// Underlying engine error.
        #[from]
        source: subflow_engine::PipelineError,
    },

    /// A controller-owned task terminated abnormally.
    #[error("internal error: {message}")]
    InternalError {
        /// Description of the failure.
        message: String,
    },
}
