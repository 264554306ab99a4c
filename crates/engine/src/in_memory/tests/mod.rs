// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

use super::InMemoryBroker;
use crate::flow_control::{FlowControlSettings, FlowController};
use crate::handoff::{HandoffReceiver, WorkItem, handoff_channel};
use crate::receiver::MessageReceiver;
use crate::stats::PipelineStats;
use crate::subscriber::{
    FailureListener, Subscriber, SubscriberBuilder, SubscriberError, SubscriberFailure,
};
use std::sync::Arc;
use std::time::Duration;
use subflow_config::{LimitExceededBehavior, SubscriptionName};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub(super) fn subscription_name(raw: &str) -> SubscriptionName {
    SubscriptionName::parse(raw).expect("subscription name should be valid")
}

/// One in-memory connection wired to a bare handoff, with the test acting as
/// the batch worker.
pub(super) struct Harness {
    pub(super) broker: InMemoryBroker,
    pub(super) subscription: SubscriptionName,
    pub(super) worker: HandoffReceiver,
    pub(super) connection: Box<dyn Subscriber>,
    pub(super) failures: mpsc::UnboundedReceiver<SubscriberFailure>,
}

impl Harness {
    /// Starts a connection whose broker-side ceiling is `connection_ceiling`.
    pub(super) async fn start(name: &str, connection_ceiling: usize) -> Self {
        let broker = InMemoryBroker::new();
        let subscription = subscription_name(name);
        broker.create_subscription(&subscription);

        let (handoff, worker) = handoff_channel();
        let flow = Arc::new(FlowController::new(FlowControlSettings {
            max_outstanding: 1024,
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }));
        let receiver = MessageReceiver::new(handoff, flow, Arc::new(PipelineStats::default()));
        let (failure_tx, failures) = mpsc::unbounded_channel();
        let mut connection = broker
            .subscriber_builder(&subscription)
            .build(
                0,
                receiver,
                FlowControlSettings {
                    max_outstanding: connection_ceiling,
                    limit_exceeded_behavior: LimitExceededBehavior::Block,
                },
                FailureListener::new(0, failure_tx),
            )
            .expect("connection should build");
        connection.start().await.expect("connection should start");
        Self {
            broker,
            subscription,
            worker,
            connection,
            failures,
        }
    }

    pub(super) fn publish(&self, payload: &'static str) -> crate::message::MessageId {
        self.broker
            .publish(&self.subscription, payload)
            .expect("publish should succeed")
    }

    pub(super) async fn next_item(&self) -> WorkItem {
        timeout(Duration::from_secs(1), self.worker.accept())
            .await
            .expect("a delivery should arrive")
            .expect("handoff should be open")
    }

    /// Drops the worker side first so a delivery blocked in the handoff is
    /// refused instead of waiting forever.
    pub(super) async fn stop(self) -> Result<(), SubscriberError> {
        let Self {
            worker,
            mut connection,
            ..
        } = self;
        drop(worker);
        connection.stop().await
    }
}
