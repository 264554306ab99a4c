// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Entry point invoked by broker connections for every delivered message.

use crate::flow_control::{FlowControlError, FlowController};
use crate::handoff::{HandoffError, HandoffSender, PendingOutcome, WorkItem};
use crate::message::{Message, NackCause, Outcome};
use crate::stats::PipelineStats;
use std::sync::Arc;

/// Errors returned by [`MessageReceiver::receive`]. The message has already
/// been nacked when one of these is returned.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    /// The outstanding-message ceiling was reached and the configured behavior
    /// is `reject`.
    #[error("flow control limit exceeded: {0}")]
    FlowControlExceeded(#[from] FlowControlError),
    /// No batch worker is accepting messages anymore.
    #[error("pipeline is closed")]
    PipelineClosed,
}

/// Admits broker deliveries into the pipeline.
///
/// Cloned into every broker connection; safe to call concurrently.
#[derive(Clone)]
pub struct MessageReceiver {
    handoff: HandoffSender,
    flow: Arc<FlowController>,
    stats: Arc<PipelineStats>,
}

impl MessageReceiver {
    /// Creates a receiver feeding `handoff` under the `flow` budget.
    #[must_use]
    pub fn new(handoff: HandoffSender, flow: Arc<FlowController>, stats: Arc<PipelineStats>) -> Self {
        Self {
            handoff,
            flow,
            stats,
        }
    }

    /// Admits one message and hands it to a batch worker.
    ///
    /// Waits while the budget is exhausted (`block` behavior) and while every
    /// worker is busy. The returned [`PendingOutcome`] resolves once the
    /// message has been acked or nacked; dropping it does not affect the
    /// message.
    pub async fn receive(&self, message: Message) -> Result<PendingOutcome, ReceiveError> {
        self.stats.record_received();
        let permit = match self.flow.acquire(1).await {
            Ok(permit) => permit,
            Err(err) => {
                tracing::warn!(
                    message_id = %message.id(),
                    error = %err,
                    "flow control rejected message, nacking it"
                );
                self.stats.record_nacked(1);
                message.nack();
                return Err(err.into());
            }
        };

        let (item, outcome) = WorkItem::new(message, permit);
        let item = item.counted_in(Arc::clone(&self.stats));
        match self.handoff.handoff(item).await {
            Ok(()) => Ok(outcome),
            Err(HandoffError::Closed(item)) => {
                tracing::warn!(
                    message_id = %item.message().id(),
                    "no batch worker available, nacking message"
                );
                self.stats.record_nacked(1);
                item.resolve(Outcome::nack(NackCause::PipelineClosed, "pipeline is closed"));
                Err(ReceiveError::PipelineClosed)
            }
        }
    }

    /// Current number of admitted, unsettled messages.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.flow.outstanding()
    }
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("outstanding", &self.flow.outstanding())
            .field("max_outstanding", &self.flow.max_outstanding())
            .finish()
    }
}
