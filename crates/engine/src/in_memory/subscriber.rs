// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

use super::broker::{InMemoryBroker, InMemoryReply, SubscriptionState};
use crate::flow_control::FlowControlSettings;
use crate::message::{AckHandle, Message};
use crate::receiver::MessageReceiver;
use crate::subscriber::{FailureListener, Subscriber, SubscriberBuilder, SubscriberError};
use async_trait::async_trait;
use std::sync::Arc;
use subflow_config::SubscriptionName;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

/// Builds [`InMemorySubscriber`] connections for one subscription.
#[derive(Debug, Clone)]
pub struct InMemorySubscriberBuilder {
    broker: InMemoryBroker,
    subscription: SubscriptionName,
    threads_per_connection: usize,
}

impl InMemorySubscriberBuilder {
    pub(super) fn new(broker: InMemoryBroker, subscription: SubscriptionName) -> Self {
        Self {
            broker,
            subscription,
            threads_per_connection: 1,
        }
    }

    /// Sets the number of concurrent delivery loops per connection.
    #[must_use]
    pub fn with_threads_per_connection(mut self, threads: usize) -> Self {
        self.threads_per_connection = threads.max(1);
        self
    }
}

impl SubscriberBuilder for InMemorySubscriberBuilder {
    fn build(
        &self,
        connection: usize,
        receiver: MessageReceiver,
        flow_control: FlowControlSettings,
        failures: FailureListener,
    ) -> Result<Box<dyn Subscriber>, SubscriberError> {
        let state = self.broker.subscription(&self.subscription)?;
        Ok(Box::new(InMemorySubscriber {
            connection,
            state,
            receiver,
            flow_control,
            failures,
            threads: self.threads_per_connection,
            running: None,
        }))
    }
}

struct Running {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// One connection to an in-memory subscription.
pub struct InMemorySubscriber {
    connection: usize,
    state: Arc<SubscriptionState>,
    receiver: MessageReceiver,
    flow_control: FlowControlSettings,
    failures: FailureListener,
    threads: usize,
    running: Option<Running>,
}

#[async_trait]
impl Subscriber for InMemorySubscriber {
    async fn start(&mut self) -> Result<(), SubscriberError> {
        if self.running.is_some() {
            return Err(SubscriberError::AlreadyStarted);
        }
        let (stop, stop_rx) = watch::channel(false);
        let outstanding = Arc::new(Semaphore::new(self.flow_control.max_outstanding));

        let mut tasks: Vec<JoinHandle<()>> = (0..self.threads)
            .map(|_| {
                tokio::spawn(delivery_loop(
                    Arc::clone(&self.state),
                    self.receiver.clone(),
                    Arc::clone(&outstanding),
                    stop_rx.clone(),
                ))
            })
            .collect();
        tasks.push(tokio::spawn(failure_monitor(
            self.state.failure(),
            self.failures.clone(),
            stop_rx,
        )));

        tracing::info!(
            subscription = %self.state.name(),
            connection = self.connection,
            threads = self.threads,
            max_outstanding = self.flow_control.max_outstanding,
            "in-memory subscriber started"
        );
        self.running = Some(Running { stop, tasks });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SubscriberError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        _ = running.stop.send_replace(true);
        let mut panicked = 0;
        for result in futures::future::join_all(running.tasks).await {
            if result.is_err() {
                panicked += 1;
            }
        }
        tracing::info!(
            subscription = %self.state.name(),
            connection = self.connection,
            "in-memory subscriber stopped"
        );
        if panicked > 0 {
            return Err(SubscriberError::StopFailed {
                reason: format!("{panicked} delivery task(s) panicked"),
            });
        }
        Ok(())
    }
}

async fn delivery_loop(
    state: Arc<SubscriptionState>,
    receiver: MessageReceiver,
    outstanding: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        let permit = tokio::select! {
            biased;
            _ = stop.changed() => break,
            permit = Arc::clone(&outstanding).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let delivery = tokio::select! {
            biased;
            _ = stop.changed() => break,
            delivery = state.backlog_rx.recv_async() => match delivery {
                Ok(delivery) => delivery,
                Err(_) => break,
            },
        };

        state.mark_delivered();
        let message = Message::new(
            delivery.id.clone(),
            delivery.payload.clone(),
            AckHandle::new(InMemoryReply {
                state: Arc::clone(&state),
                delivery: delivery.clone(),
                _permit: permit,
            }),
        )
        .with_attributes(delivery.attributes)
        .with_delivery_attempt(delivery.attempt);

        // Settlement happens through the ack token; the outcome handle is not needed.
        if let Err(err) = receiver.receive(message).await {
            tracing::debug!(
                subscription = %state.name(),
                error = %err,
                "delivery refused by pipeline"
            );
        }
    }
}

async fn failure_monitor(
    mut failure: watch::Receiver<Option<String>>,
    listener: FailureListener,
    mut stop: watch::Receiver<bool>,
) {
    let reason = tokio::select! {
        biased;
        _ = stop.changed() => return,
        reason = failure.wait_for(Option::is_some) => match reason {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => return,
        },
    };
    listener.failed(reason);
}
