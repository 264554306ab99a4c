// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the configuration crate.

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("failed to read configuration file `{path}`: {details}")]
    FileReadError {
        /// Path of the file that failed to load.
        path: String,
        /// Underlying I/O error message.
        details: String,
    },
    /// The configuration file extension is not one of the supported formats.
    #[error("unsupported configuration file format for `{path}` (expected .json, .yaml or .yml)")]
    UnsupportedFileFormat {
        /// Path of the rejected file.
        path: String,
    },
    /// The configuration content could not be deserialized.
    #[error("failed to parse {format} configuration: {details}")]
    DeserializationError {
        /// Source format (`json` or `yaml`).
        format: &'static str,
        /// Deserializer error message.
        details: String,
    },
    /// The configuration was parsed but violates a constraint.
    #[error("invalid user configuration: {error}")]
    InvalidUserConfig {
        /// Human-readable validation failure(s).
        error: String,
    },
}
