// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Subscription source declaration: batching policy, worker pool and broker
//! connection layout.

use crate::error::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of a broker subscription.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
#[schemars(with = "String")]
pub struct SubscriptionName(String);

impl SubscriptionName {
    /// Parses and validates a subscription name.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Err("subscription name must be non-empty".to_owned());
        }
        Ok(Self(raw.to_owned()))
    }

    /// Returns the subscription name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriptionName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::borrow::Borrow<str> for SubscriptionName {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for SubscriptionName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value.as_str())
    }
}

impl From<SubscriptionName> for String {
    fn from(value: SubscriptionName) -> Self {
        value.0
    }
}

impl From<&'static str> for SubscriptionName {
    fn from(value: &'static str) -> Self {
        Self::parse(value).expect("invalid static subscription name literal")
    }
}

/// Payload format used to turn a message into records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// One record per UTF-8 line.
    #[default]
    Text,
    /// One record per JSON value; payloads may hold several concatenated values.
    Json,
}

/// Behavior when a delivery would push the outstanding count above the ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitExceededBehavior {
    /// Stall the delivering callback until budget is released.
    #[default]
    Block,
    /// Nack the delivery immediately so the broker redelivers it later.
    Reject,
}

/// Batch closing policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
    /// Maximum number of messages in one batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum time a non-empty batch stays open, in milliseconds.
    #[serde(default = "default_max_wait_time_ms")]
    pub max_wait_time_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_wait_time_ms: default_max_wait_time_ms(),
        }
    }
}

impl BatchSettings {
    /// Returns the batch wait time as a [`Duration`].
    #[must_use]
    pub const fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }
}

/// Broker-side connection layout.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AdvancedSettings {
    /// Number of concurrent subscriber connections opened against the broker.
    #[serde(default = "default_num_subscribers")]
    pub num_subscribers: usize,
    /// Number of delivery threads each subscriber connection uses.
    #[serde(default = "default_num_threads_per_subscriber")]
    pub num_threads_per_subscriber: usize,
    /// Optional broker endpoint override (for example an emulator).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_endpoint: Option<String>,
    /// What happens when the outstanding-message ceiling is reached.
    #[serde(default)]
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            num_subscribers: default_num_subscribers(),
            num_threads_per_subscriber: default_num_threads_per_subscriber(),
            custom_endpoint: None,
            limit_exceeded_behavior: LimitExceededBehavior::default(),
        }
    }
}

/// Full configuration of one subscription source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Subscription to consume from.
    pub subscription: SubscriptionName,
    /// Payload format.
    #[serde(default)]
    pub data_format: DataFormat,
    /// Maximum length in bytes of a single parsed record.
    #[serde(default = "default_max_record_length")]
    pub max_record_length: usize,
    /// Batch closing policy.
    #[serde(default)]
    pub basic: BatchSettings,
    /// Number of batch workers.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Broker-side connection layout.
    #[serde(default)]
    pub advanced: AdvancedSettings,
}

impl SourceConfig {
    /// Creates a configuration with default settings for `subscription`.
    #[must_use]
    pub fn new(subscription: SubscriptionName) -> Self {
        Self {
            subscription,
            data_format: DataFormat::default(),
            max_record_length: default_max_record_length(),
            basic: BatchSettings::default(),
            max_threads: default_max_threads(),
            advanced: AdvancedSettings::default(),
        }
    }

    /// Loads a configuration from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
            path: display.clone(),
            details: e.to_string(),
        })?;

        match extension.as_deref() {
            Some("json") => Self::from_json(&content),
            Some("yaml" | "yml") => Self::from_yaml(&content),
            _ => Err(Error::UnsupportedFileFormat { path: display }),
        }
    }

    /// Parses a JSON configuration.
    pub fn from_json(content: &str) -> Result<Self, Error> {
        serde_json::from_str(content).map_err(|e| Error::DeserializationError {
            format: "json",
            details: e.to_string(),
        })
    }

    /// Parses a YAML configuration.
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        serde_yaml::from_str(content).map_err(|e| Error::DeserializationError {
            format: "yaml",
            details: e.to_string(),
        })
    }

    /// Number of batch workers.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.max_threads
    }

    /// Batch size to use when the embedding framework also imposes a limit.
    #[must_use]
    pub fn effective_batch_size(&self, requested: usize) -> usize {
        requested.min(self.basic.max_batch_size)
    }

    /// Outstanding-message ceiling per subscriber connection.
    ///
    /// `max_batch_size * max_threads / num_subscribers`: enough to fill every
    /// worker's batch once, split across the broker connections because the
    /// broker client enforces its limit per connection.
    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.basic
            .max_batch_size
            .saturating_mul(self.max_threads)
            .checked_div(self.advanced.num_subscribers)
            .unwrap_or(0)
    }

    /// Returns validation errors for this configuration.
    #[must_use]
    pub fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.basic.max_batch_size == 0 {
            errors.push(format!(
                "{path_prefix}.basic.max_batch_size must be greater than 0"
            ));
        }
        if self.basic.max_wait_time_ms == 0 {
            errors.push(format!(
                "{path_prefix}.basic.max_wait_time_ms must be greater than 0"
            ));
        }
        if self.max_threads == 0 {
            errors.push(format!("{path_prefix}.max_threads must be greater than 0"));
        }
        if self.max_record_length == 0 {
            errors.push(format!(
                "{path_prefix}.max_record_length must be greater than 0"
            ));
        }
        if self.advanced.num_subscribers == 0 {
            errors.push(format!(
                "{path_prefix}.advanced.num_subscribers must be greater than 0"
            ));
        }
        if self.advanced.num_threads_per_subscriber == 0 {
            errors.push(format!(
                "{path_prefix}.advanced.num_threads_per_subscriber must be greater than 0"
            ));
        }
        if let Some(endpoint) = &self.advanced.custom_endpoint {
            if endpoint.trim().is_empty() {
                errors.push(format!(
                    "{path_prefix}.advanced.custom_endpoint must be non-empty when set"
                ));
            }
        }
        // Only meaningful once the individual factors are valid.
        if errors.is_empty() && self.max_outstanding() == 0 {
            errors.push(format!(
                "{path_prefix}: max_batch_size * max_threads / num_subscribers must be at least 1 (got {} * {} / {})",
                self.basic.max_batch_size, self.max_threads, self.advanced.num_subscribers
            ));
        }
        errors
    }

    /// Validates this configuration, joining all failures into one error.
    pub fn validate(&self) -> Result<(), Error> {
        let errors = self.validation_errors("source");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidUserConfig {
                error: errors.join("; "),
            })
        }
    }
}

const fn default_max_batch_size() -> usize {
    1000
}

const fn default_max_wait_time_ms() -> u64 {
    2000
}

const fn default_max_threads() -> usize {
    1
}

const fn default_max_record_length() -> usize {
    4096
}

const fn default_num_subscribers() -> usize {
    1
}

const fn default_num_threads_per_subscriber() -> usize {
    1
}
