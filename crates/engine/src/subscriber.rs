// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Broker client seam.
//!
//! A broker integration provides a [`SubscriberBuilder`]. The pipeline builds
//! one [`Subscriber`] per configured connection, handing each a
//! [`MessageReceiver`] to feed deliveries into and a [`FailureListener`] to
//! report unrecoverable connection failures through.

use crate::flow_control::FlowControlSettings;
use crate::receiver::MessageReceiver;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors raised by broker connections.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    /// The configured subscription does not exist on the broker.
    #[error("subscription `{subscription}` not found")]
    SubscriptionNotFound {
        /// Subscription name.
        subscription: String,
    },
    /// The connection could not be opened.
    #[error("failed to start subscriber: {reason}")]
    StartFailed {
        /// Underlying failure.
        reason: String,
    },
    /// `start` was called on a running connection.
    #[error("subscriber already started")]
    AlreadyStarted,
    /// The connection did not shut down cleanly.
    #[error("failed to stop subscriber: {reason}")]
    StopFailed {
        /// Underlying failure.
        reason: String,
    },
}

/// Unrecoverable failure of a running connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    /// Index of the failed connection.
    pub connection: usize,
    /// Failure reported by the broker client.
    pub reason: String,
}

/// Channel through which connections escalate fatal failures to the pipeline.
#[derive(Debug, Clone)]
pub struct FailureListener {
    connection: usize,
    sender: mpsc::UnboundedSender<SubscriberFailure>,
}

impl FailureListener {
    pub(crate) fn new(connection: usize, sender: mpsc::UnboundedSender<SubscriberFailure>) -> Self {
        Self { connection, sender }
    }

    /// Index of the connection this listener belongs to.
    #[must_use]
    pub fn connection(&self) -> usize {
        self.connection
    }

    /// Reports that the connection has failed. The pipeline shuts down.
    pub fn failed(&self, reason: impl Into<String>) {
        let failure = SubscriberFailure {
            connection: self.connection,
            reason: reason.into(),
        };
        tracing::error!(
            connection = failure.connection,
            reason = %failure.reason,
            "subscriber connection failed"
        );
        let _ignore_closed = self.sender.send(failure);
    }
}

/// One broker connection for a subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Opens the connection and starts delivering messages.
    async fn start(&mut self) -> Result<(), SubscriberError>;

    /// Stops delivering and waits until no delivery callback is running.
    async fn stop(&mut self) -> Result<(), SubscriberError>;
}

/// Builds broker connections for a pipeline.
pub trait SubscriberBuilder: Send + Sync {
    /// Builds connection `connection` feeding `receiver`.
    ///
    /// The broker client must cap its unsettled deliveries at
    /// `flow_control.max_outstanding`.
    fn build(
        &self,
        connection: usize,
        receiver: MessageReceiver,
        flow_control: FlowControlSettings,
        failures: FailureListener,
    ) -> Result<Box<dyn Subscriber>, SubscriberError>;
}
