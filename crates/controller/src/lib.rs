// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Subflow controller
//!
//! Owns the process-level concerns around one pipeline: it builds the
//! multi-threaded Tokio runtime, turns Ctrl-C into a [`StopSignal`], wires the
//! in-memory broker (optionally fed by a demo publisher) and runs the pipeline
//! until it is stopped or fails.

use std::time::Duration;
use subflow_config::{DataFormat, SourceConfig, SubscriptionName};
use subflow_engine::in_memory::InMemoryBroker;
use subflow_engine::{
    FormatParser, LoggingSink, Pipeline, PipelineSettings, StatsSnapshot, StopSignal,
};

/// Error types and helpers for the controller module.
pub mod error;

pub use error::Error;

/// Process-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Tokio worker threads (`None` uses one per CPU core).
    pub worker_threads: Option<usize>,
    /// How often the pipeline checks the stop signal.
    pub poll_interval: Duration,
    /// Upper bound on the configured batch size (`None` keeps it as is).
    pub batch_size_limit: Option<usize>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            worker_threads: None,
            poll_interval: PipelineSettings::default().poll_interval,
            batch_size_limit: None,
        }
    }
}

/// Synthetic traffic published into the in-memory subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoFeed {
    /// Number of messages to publish. `None` publishes until stopped; a
    /// bounded feed stops the pipeline once every message has been acked.
    pub messages: Option<usize>,
    /// Pause between two publications.
    pub interval: Duration,
}

impl DemoFeed {
    /// A feed that publishes nothing.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            messages: Some(0),
            interval: Duration::ZERO,
        }
    }
}

/// Runs pipelines in the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Controller {
    settings: ControllerSettings,
}

impl Controller {
    /// Creates a controller.
    #[must_use]
    pub const fn new(settings: ControllerSettings) -> Self {
        Self { settings }
    }

    /// Runs `config` against the in-memory broker until Ctrl-C, a fatal
    /// failure, or (for a bounded feed) until every published message has
    /// been acked. Blocks the calling thread.
    pub fn run_forever(&self, config: SourceConfig, feed: DemoFeed) -> Result<StatsSnapshot, Error> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        _ = builder.enable_all().thread_name("subflow-runtime");
        if let Some(threads) = self.settings.worker_threads {
            _ = builder.worker_threads(threads.max(1));
        }
        let runtime = builder.build().map_err(|e| Error::RuntimeError {
            details: e.to_string(),
        })?;

        let settings = PipelineSettings {
            poll_interval: self.settings.poll_interval,
            batch_size_limit: self.settings.batch_size_limit,
        };
        runtime.block_on(async move {
            let stop = StopSignal::new();
            let ctrl_c = {
                let stop = stop.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Ctrl-C received, stopping");
                        stop.stop();
                    }
                })
            };
            let result = run_in_memory(&config, feed, stop, settings).await;
            ctrl_c.abort();
            result
        })
    }
}

/// Async body of [`Controller::run_forever`], without runtime or signal
/// handling.
pub async fn run_in_memory(
    config: &SourceConfig,
    feed: DemoFeed,
    stop: StopSignal,
    settings: PipelineSettings,
) -> Result<StatsSnapshot, Error> {
    if let Some(endpoint) = &config.advanced.custom_endpoint {
        tracing::warn!(
            endpoint = %endpoint,
            "custom endpoints are not supported by the in-memory broker, ignoring"
        );
    }
    let broker = InMemoryBroker::new();
    broker.create_subscription(&config.subscription);
    let builder = broker
        .subscriber_builder(&config.subscription)
        .with_threads_per_connection(config.advanced.num_threads_per_subscriber);

    let pipeline = Pipeline::start(
        config,
        FormatParser::from_config(config),
        LoggingSink,
        &builder,
        settings,
    )
    .await?;

    let publisher = tokio::spawn(publish_feed(
        broker,
        config.subscription.clone(),
        config.data_format,
        feed,
        stop.clone(),
    ));
    let result = pipeline.run(stop.clone()).await;
    stop.stop();
    publisher.await.map_err(|e| Error::InternalError {
        message: format!("demo publisher task failed: {e}"),
    })?;

    let stats = result?;
    tracing::info!(
        received = stats.received,
        acked = stats.acked,
        nacked = stats.nacked,
        batches = stats.batches_delivered,
        "pipeline finished"
    );
    Ok(stats)
}

async fn publish_feed(
    broker: InMemoryBroker,
    subscription: SubscriptionName,
    format: DataFormat,
    feed: DemoFeed,
    stop: StopSignal,
) {
    let mut sequence = 0usize;
    while !stop.is_stopped() && feed.messages.is_none_or(|limit| sequence < limit) {
        if let Err(err) = broker.publish(&subscription, demo_payload(format, sequence)) {
            tracing::error!(error = %err, "demo publisher stopped");
            return;
        }
        sequence += 1;
        if !feed.interval.is_zero() {
            tokio::time::sleep(feed.interval).await;
        }
    }
    if feed.messages.is_none() {
        return;
    }

    tracing::info!(published = sequence, "demo feed complete, waiting for acks");
    while !stop.is_stopped() {
        if broker.is_drained(&subscription) {
            tracing::info!("all demo messages acked");
            stop.stop();
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn demo_payload(format: DataFormat, sequence: usize) -> String {
    match format {
        DataFormat::Text => format!("demo event {sequence}\nsecond line of event {sequence}"),
        DataFormat::Json => serde_json::json!({
            "sequence": sequence,
            "source": "subflow-demo",
        })
        .to_string(),
    }
}
