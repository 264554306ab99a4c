// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Pipeline lifecycle: start, run until stopped, ordered shutdown.
//!
//! Startup order is configuration validation, flow controller and handoff,
//! worker pool, then broker connections. Shutdown goes the other way: broker
//! connections are stopped (and awaited) first so no new message enters, then
//! workers flush their in-flight batches.

use crate::error::PipelineError;
use crate::flow_control::{FlowControlSettings, FlowController};
use crate::handoff::handoff_channel;
use crate::parser::RecordParser;
use crate::receiver::MessageReceiver;
use crate::sink::BatchSink;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::subscriber::{
    FailureListener, Subscriber, SubscriberBuilder, SubscriberError, SubscriberFailure,
};
use crate::worker::{WorkerPool, WorkerSettings};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use subflow_config::{SourceConfig, SubscriptionName};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Externally controlled stop flag, polled by [`Pipeline::run_until_stopped`].
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the pipeline to stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle settings that are not part of the source configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// How often the stop signal is checked.
    pub poll_interval: Duration,
    /// Batch-size cap imposed by the embedding runtime, if any.
    pub batch_size_limit: Option<usize>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size_limit: None,
        }
    }
}

/// A running subscription source.
pub struct Pipeline {
    subscription: SubscriptionName,
    settings: PipelineSettings,
    flow: Arc<FlowController>,
    stats: Arc<PipelineStats>,
    workers: WorkerPool,
    subscribers: Vec<Box<dyn Subscriber>>,
    failures: mpsc::UnboundedReceiver<SubscriberFailure>,
}

impl Pipeline {
    /// Validates `config` and starts workers and broker connections.
    ///
    /// Nothing is left running when an error is returned.
    pub async fn start<P, S>(
        config: &SourceConfig,
        parser: P,
        sink: S,
        builder: &dyn SubscriberBuilder,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError>
    where
        P: RecordParser,
        S: BatchSink<P::Record>,
    {
        config.validate()?;

        let flow_control = FlowControlSettings::from_config(config);
        let flow = Arc::new(FlowController::new(flow_control));
        let stats = Arc::new(PipelineStats::default());
        let (handoff_tx, handoff_rx) = handoff_channel();
        let workers = WorkerPool::start(
            config.worker_count(),
            WorkerSettings::from_config(config, settings.batch_size_limit),
            &handoff_rx,
            Arc::new(parser),
            Arc::new(sink),
            Arc::clone(&stats),
        );
        drop(handoff_rx);

        let receiver = MessageReceiver::new(handoff_tx, Arc::clone(&flow), Arc::clone(&stats));
        let (failure_tx, failures) = mpsc::unbounded_channel();
        let mut subscribers: Vec<Box<dyn Subscriber>> =
            Vec::with_capacity(config.advanced.num_subscribers);
        for connection in 0..config.advanced.num_subscribers {
            let started: Result<Box<dyn Subscriber>, SubscriberError> = async {
                let mut subscriber = builder.build(
                    connection,
                    receiver.clone(),
                    flow_control,
                    FailureListener::new(connection, failure_tx.clone()),
                )?;
                subscriber.start().await?;
                Ok(subscriber)
            }
            .await;
            match started {
                Ok(subscriber) => subscribers.push(subscriber),
                Err(source) => {
                    tracing::error!(
                        subscription = %config.subscription,
                        connection,
                        error = %source,
                        "failed to start subscriber, tearing down pipeline"
                    );
                    stop_subscribers(&mut subscribers).await;
                    drop(subscribers);
                    workers.shutdown().await;
                    return Err(PipelineError::SubscriberStart { connection, source });
                }
            }
        }

        tracing::info!(
            subscription = %config.subscription,
            connections = subscribers.len(),
            workers = workers.len(),
            max_outstanding = flow_control.max_outstanding,
            limit_exceeded_behavior = ?flow_control.limit_exceeded_behavior,
            "pipeline started"
        );
        Ok(Self {
            subscription: config.subscription.clone(),
            settings,
            flow,
            stats,
            workers,
            subscribers,
            failures,
        })
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Shared outstanding-message budget.
    #[must_use]
    pub fn flow_controller(&self) -> Arc<FlowController> {
        Arc::clone(&self.flow)
    }

    /// Returns once `stop` is set, or with an error when a broker connection
    /// reports an unrecoverable failure. Does not shut anything down.
    pub async fn run_until_stopped(&mut self, stop: &StopSignal) -> Result<(), PipelineError> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if stop.is_stopped() {
                        tracing::info!(subscription = %self.subscription, "stop requested");
                        return Ok(());
                    }
                }
                Some(failure) = self.failures.recv() => {
                    return Err(PipelineError::SubscriberFailed {
                        connection: failure.connection,
                        reason: failure.reason,
                    });
                }
            }
        }
    }

    /// Runs until stopped or failed, then shuts down in order.
    pub async fn run(mut self, stop: StopSignal) -> Result<StatsSnapshot, PipelineError> {
        let result = self.run_until_stopped(&stop).await;
        let snapshot = self.shutdown().await;
        result.map(|()| snapshot)
    }

    /// Stops every broker connection, then flushes and stops the workers.
    pub async fn shutdown(self) -> StatsSnapshot {
        let Self {
            subscription,
            flow,
            stats,
            workers,
            mut subscribers,
            ..
        } = self;
        tracing::info!(subscription = %subscription, "stopping pipeline");
        stop_subscribers(&mut subscribers).await;
        drop(subscribers);
        workers.shutdown().await;

        let snapshot = stats.snapshot();
        tracing::info!(
            subscription = %subscription,
            outstanding = flow.outstanding(),
            received = snapshot.received,
            acked = snapshot.acked,
            nacked = snapshot.nacked,
            "pipeline stopped"
        );
        snapshot
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("subscription", &self.subscription)
            .field("connections", &self.subscribers.len())
            .field("workers", &self.workers.len())
            .field("outstanding", &self.flow.outstanding())
            .finish()
    }
}

async fn stop_subscribers(subscribers: &mut [Box<dyn Subscriber>]) {
    let results =
        futures::future::join_all(subscribers.iter_mut().map(|subscriber| subscriber.stop())).await;
    for (connection, result) in results.into_iter().enumerate() {
        if let Err(err) = result {
            tracing::warn!(connection, error = %err, "subscriber did not stop cleanly");
        }
    }
}
