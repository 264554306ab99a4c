// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the subflow subscription source.
//!
//! The source is configured with the batch policy (`basic`), the worker pool
//! size (`max_threads`) and the broker-side connection layout (`advanced`).
//! The flow-control ceiling handed to the broker client is derived from those
//! values, see [`SourceConfig::max_outstanding`].

pub mod error;
pub mod source;

pub use error::Error;
pub use source::{
    AdvancedSettings, BatchSettings, DataFormat, LimitExceededBehavior, SourceConfig,
    SubscriptionName,
};
