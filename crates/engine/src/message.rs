// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Broker message model and single-use acknowledgment tokens.
//!
//! # Ack/Nack
//!
//! A broker connection hands every delivery to the pipeline together with an
//! [`AckReplyConsumer`]. The consumer is wrapped in an [`AckHandle`] whose
//! `ack()`/`nack()` take `self` by value, so a message can be settled at most
//! once. Dropping an unsettled handle nacks it, so every delivery is settled
//! exactly once even when the owning task unwinds.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Arc<str>);

impl MessageId {
    /// Creates a message identifier.
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Broker-side settlement of one delivery.
///
/// Implemented by broker connections. Both methods consume the boxed consumer.
pub trait AckReplyConsumer: Send {
    /// The message was durably processed; the broker must not redeliver it.
    fn ack(self: Box<Self>);

    /// The message was not processed; the broker should redeliver it.
    fn nack(self: Box<Self>);
}

/// Single-use acknowledgment token carried by a [`Message`].
pub struct AckHandle {
    consumer: Option<Box<dyn AckReplyConsumer>>,
}

impl AckHandle {
    /// Wraps a broker reply consumer.
    pub fn new(consumer: impl AckReplyConsumer + 'static) -> Self {
        Self {
            consumer: Some(Box::new(consumer)),
        }
    }

    /// Acknowledges the delivery.
    pub fn ack(mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.ack();
        }
    }

    /// Negatively acknowledges the delivery.
    pub fn nack(mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.nack();
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            tracing::warn!("ack handle dropped without settlement, nacking delivery");
            consumer.nack();
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("settled", &self.consumer.is_none())
            .finish()
    }
}

/// A message delivered by the broker for a subscription.
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    payload: Bytes,
    attributes: BTreeMap<String, String>,
    delivery_attempt: u32,
    received_at: SystemTime,
    ack: AckHandle,
}

impl Message {
    /// Creates a first-attempt message received now.
    pub fn new(id: impl Into<MessageId>, payload: impl Into<Bytes>, ack: AckHandle) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            attributes: BTreeMap::new(),
            delivery_attempt: 1,
            received_at: SystemTime::now(),
            ack,
        }
    }

    /// Sets the broker attributes attached to this message.
    #[must_use]
    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets how many times the broker has delivered this message.
    #[must_use]
    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt;
        self
    }

    /// Broker-assigned identifier.
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Opaque payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Broker attributes.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Delivery attempt, starting at 1.
    #[must_use]
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// Local receipt timestamp.
    #[must_use]
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Acknowledges this message.
    pub fn ack(self) {
        self.ack.ack();
    }

    /// Negatively acknowledges this message.
    pub fn nack(self) {
        self.ack.nack();
    }
}

/// Why a message was nacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackCause {
    /// The payload could not be parsed into records.
    ParseFailed,
    /// The downstream consumer rejected the batch holding the message.
    BatchRejected,
    /// The outstanding-message ceiling was reached with `reject` behavior.
    FlowControl,
    /// No batch worker could accept the message.
    PipelineClosed,
    /// The work item was dropped before it was settled.
    Abandoned,
}

impl NackCause {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseFailed => "parse_failed",
            Self::BatchRejected => "batch_rejected",
            Self::FlowControl => "flow_control",
            Self::PipelineClosed => "pipeline_closed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Final settlement of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The message was acknowledged.
    Ack,
    /// The message was negatively acknowledged.
    Nack {
        /// Failure category.
        cause: NackCause,
        /// Human-readable reason.
        reason: String,
    },
}

impl Outcome {
    /// Builds a nack outcome.
    #[must_use]
    pub fn nack(cause: NackCause, reason: impl Into<String>) -> Self {
        Self::Nack {
            cause,
            reason: reason.into(),
        }
    }

    /// Returns `true` for [`Outcome::Ack`].
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}
