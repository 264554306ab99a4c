// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Outstanding-message budget.
//!
//! The budget counts messages that were admitted but not yet acked or nacked.
//! It does not queue anything: a failed [`FlowController::admit`] means the
//! broker has to stall (or redeliver later) instead of handing over more work.
//! The ceiling must match the one configured on the broker client, see
//! [`FlowControlSettings::from_config`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use subflow_config::{LimitExceededBehavior, SourceConfig};
use tokio::sync::Notify;

/// Flow-control limits shared by the local budget and the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlSettings {
    /// Maximum number of unsettled messages.
    pub max_outstanding: usize,
    /// Behavior once `max_outstanding` is reached.
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

impl FlowControlSettings {
    /// Derives the settings from a source configuration.
    #[must_use]
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            max_outstanding: config.max_outstanding(),
            limit_exceeded_behavior: config.advanced.limit_exceeded_behavior,
        }
    }
}

/// Errors returned by [`FlowController::admit`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlError {
    /// Admitting the messages would push the outstanding count over the ceiling.
    #[error(
        "admitting {requested} message(s) would exceed the outstanding limit ({outstanding}/{max_outstanding})"
    )]
    WouldExceed {
        /// Number of messages requested.
        requested: usize,
        /// Outstanding count observed at the time of the request.
        outstanding: usize,
        /// Configured ceiling.
        max_outstanding: usize,
    },
    /// The request can never be satisfied because it is larger than the ceiling.
    #[error("cannot admit {requested} message(s) with an outstanding limit of {max_outstanding}")]
    RequestTooLarge {
        /// Number of messages requested.
        requested: usize,
        /// Configured ceiling.
        max_outstanding: usize,
    },
}

/// Shared outstanding-message counter with a fixed ceiling.
#[derive(Debug)]
pub struct FlowController {
    outstanding: AtomicUsize,
    max_outstanding: usize,
    limit_exceeded_behavior: LimitExceededBehavior,
    released: Notify,
}

impl FlowController {
    /// Creates an empty budget.
    #[must_use]
    pub fn new(settings: FlowControlSettings) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            max_outstanding: settings.max_outstanding,
            limit_exceeded_behavior: settings.limit_exceeded_behavior,
            released: Notify::new(),
        }
    }

    /// Current number of admitted, unsettled messages.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Configured ceiling.
    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Configured behavior once the ceiling is reached.
    #[must_use]
    pub fn limit_exceeded_behavior(&self) -> LimitExceededBehavior {
        self.limit_exceeded_behavior
    }

    /// Reserves `count` messages, failing if that would exceed the ceiling.
    pub fn admit(&self, count: usize) -> Result<(), FlowControlError> {
        if count > self.max_outstanding {
            return Err(FlowControlError::RequestTooLarge {
                requested: count,
                max_outstanding: self.max_outstanding,
            });
        }
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current + count;
                (next <= self.max_outstanding).then_some(next)
            })
            .map(|_| ())
            .map_err(|outstanding| FlowControlError::WouldExceed {
                requested: count,
                outstanding,
                max_outstanding: self.max_outstanding,
            })
    }

    /// Returns `count` messages to the budget. Never fails.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            })
            .unwrap_or_else(|current| current);
        if previous < count {
            tracing::warn!(
                released = count,
                outstanding = previous,
                "flow control release exceeds outstanding count, clamping to zero"
            );
        }
        self.released.notify_waiters();
    }

    /// Reserves `count` messages, waiting for releases while the ceiling is reached.
    pub async fn admit_or_wait(&self, count: usize) -> Result<(), FlowControlError> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release between the check and the
            // await still wakes us.
            _ = released.as_mut().enable();
            match self.admit(count) {
                Ok(()) => return Ok(()),
                Err(FlowControlError::WouldExceed { .. }) => released.await,
                Err(err) => return Err(err),
            }
        }
    }

    /// Reserves `count` messages according to the configured behavior and
    /// returns a permit that gives them back when dropped.
    pub async fn acquire(self: &Arc<Self>, count: usize) -> Result<FlowPermit, FlowControlError> {
        match self.limit_exceeded_behavior {
            LimitExceededBehavior::Block => self.admit_or_wait(count).await?,
            LimitExceededBehavior::Reject => self.admit(count)?,
        }
        Ok(FlowPermit {
            controller: Arc::clone(self),
            count,
        })
    }
}

/// A reserved share of the outstanding budget.
///
/// Released exactly once, either through [`FlowPermit::release`] or on drop.
#[derive(Debug)]
pub struct FlowPermit {
    controller: Arc<FlowController>,
    count: usize,
}

impl FlowPermit {
    /// Number of messages covered by this permit.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the reserved messages to the budget.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FlowPermit {
    fn drop(&mut self) {
        self.controller.release(self.count);
    }
}
