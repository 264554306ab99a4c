// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Batch workers.
//!
//! Each worker owns at most one open batch and cycles through
//! `Idle -> Accumulating -> Closing -> Idle`:
//!
//! - Idle: waits without bound for the next handed-off message.
//! - Accumulating: the first parsed message opens the batch and starts its
//!   deadline (`max_wait_time`). Further messages are accepted until the batch
//!   is full or the deadline elapses.
//! - Closing: the batch is delivered to the sink in one call, then every
//!   underlying message is acked (success) or nacked (failure). Nothing is
//!   accepted while closing, which is what stalls the handoff and, through
//!   it, the broker.
//!
//! A message that fails to parse is nacked on the spot and never joins a batch.
//! A sink that panics fails its batch like any other sink error; the worker
//! keeps running.

use crate::batch::{CloseReason, OpenBatch};
use crate::handoff::{AcceptError, HandoffReceiver, WorkItem};
use crate::message::{NackCause, Outcome};
use crate::parser::RecordParser;
use crate::sink::{BatchSink, SinkError};
use crate::stats::PipelineStats;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use subflow_config::SourceConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Batch limits applied by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Number of messages that closes a batch as full.
    pub max_batch_size: usize,
    /// Time after the first message at which a non-empty batch closes.
    pub max_wait_time: Duration,
}

impl WorkerSettings {
    /// Derives the batch limits from a source configuration.
    ///
    /// `batch_size_limit` is a cap imposed by the embedding runtime; the
    /// smaller of it and the configured batch size applies.
    #[must_use]
    pub fn from_config(config: &SourceConfig, batch_size_limit: Option<usize>) -> Self {
        let max_batch_size = batch_size_limit
            .map_or(config.basic.max_batch_size, |limit| {
                config.effective_batch_size(limit)
            })
            .max(1);
        Self {
            max_batch_size,
            max_wait_time: config.basic.max_wait_time(),
        }
    }
}

enum Event {
    Item(WorkItem),
    DeadlineElapsed,
    Shutdown,
}

struct BatchWorker<P: RecordParser, S> {
    id: usize,
    settings: WorkerSettings,
    handoff: HandoffReceiver,
    parser: Arc<P>,
    sink: Arc<S>,
    stats: Arc<PipelineStats>,
    shutdown: watch::Receiver<bool>,
}

impl<P, S> BatchWorker<P, S>
where
    P: RecordParser,
    S: BatchSink<P::Record>,
{
    async fn run(mut self) {
        tracing::debug!(worker = self.id, "batch worker started");
        let mut batch: Option<OpenBatch<P::Record>> = None;
        loop {
            let deadline = batch.as_ref().map(OpenBatch::deadline);
            match self.next_event(deadline).await {
                Event::Item(item) => {
                    if self.add(&mut batch, item) {
                        if let Some(full) = batch.take() {
                            self.close(full, CloseReason::Full).await;
                        }
                    }
                }
                Event::DeadlineElapsed => {
                    if let Some(open) = batch.take() {
                        self.close(open, CloseReason::Timeout).await;
                    }
                }
                Event::Shutdown => break,
            }
        }

        // Take whatever a receiver is still offering, then flush.
        while let Some(item) = self.handoff.try_accept() {
            if self.add(&mut batch, item) {
                if let Some(full) = batch.take() {
                    self.close(full, CloseReason::Full).await;
                }
            }
        }
        if let Some(open) = batch.take() {
            self.close(open, CloseReason::Shutdown).await;
        }
        tracing::debug!(worker = self.id, "batch worker stopped");
    }

    async fn next_event(&mut self, deadline: Option<Instant>) -> Event {
        if *self.shutdown.borrow() {
            return Event::Shutdown;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Event::DeadlineElapsed;
        }

        let handoff = &self.handoff;
        let shutdown = &mut self.shutdown;
        let accept = async move {
            match deadline {
                Some(deadline) => handoff.accept_until(deadline).await,
                None => handoff.accept().await,
            }
        };
        tokio::select! {
            biased;
            _ = shutdown.changed() => Event::Shutdown,
            accepted = accept => match accepted {
                Ok(item) => Event::Item(item),
                Err(AcceptError::TimedOut) => Event::DeadlineElapsed,
                Err(AcceptError::Closed) => Event::Shutdown,
            },
        }
    }

    /// Parses `item` into the open batch (opening one if needed). Returns
    /// `true` once the batch is full.
    fn add(&self, batch: &mut Option<OpenBatch<P::Record>>, item: WorkItem) -> bool {
        match self.parser.parse(item.message()) {
            Ok(records) => {
                let open = batch.get_or_insert_with(|| {
                    self.stats.record_batch_opened();
                    OpenBatch::open(self.settings.max_wait_time)
                });
                open.push(item, records);
                open.size() >= self.settings.max_batch_size
            }
            Err(err) => {
                tracing::warn!(
                    worker = self.id,
                    message_id = %item.message().id(),
                    error = %err,
                    "failed to parse message, nacking it"
                );
                self.stats.record_parse_error();
                item.resolve(Outcome::nack(NackCause::ParseFailed, err.to_string()));
                false
            }
        }
    }

    async fn close(&self, batch: OpenBatch<P::Record>, reason: CloseReason) {
        let closed = batch.close(reason);
        let size = closed.size();
        self.stats.record_batch_closed(closed.reason());
        tracing::debug!(
            worker = self.id,
            reason = reason.as_str(),
            size,
            "closing batch"
        );

        let (records, settlement) = closed.into_parts();
        let delivered = AssertUnwindSafe(self.sink.deliver(records))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(SinkError::from_panic(&*panic)));
        match delivered {
            Ok(()) => {
                self.stats.record_batch_outcome(true, size);
                settlement.ack_all();
            }
            Err(err) => {
                tracing::warn!(
                    worker = self.id,
                    size,
                    error = %err,
                    "sink failed to process batch, nacking its messages"
                );
                self.stats.record_batch_outcome(false, size);
                settlement.nack_all(&err.to_string());
            }
        }
    }
}

/// A fixed set of batch workers sharing one handoff receiver.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers on the current Tokio runtime.
    pub fn start<P, S>(
        count: usize,
        settings: WorkerSettings,
        handoff: &HandoffReceiver,
        parser: Arc<P>,
        sink: Arc<S>,
        stats: Arc<PipelineStats>,
    ) -> Self
    where
        P: RecordParser,
        S: BatchSink<P::Record>,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = (0..count)
            .map(|id| {
                let worker = BatchWorker {
                    id,
                    settings,
                    handoff: handoff.clone(),
                    parser: Arc::clone(&parser),
                    sink: Arc::clone(&sink),
                    stats: Arc::clone(&stats),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        tracing::info!(
            workers = count,
            max_batch_size = settings.max_batch_size,
            max_wait_time_ms = settings.max_wait_time.as_millis() as u64,
            "batch workers started"
        );
        Self { shutdown, handles }
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Tells every worker to close its in-flight batch and waits for them.
    pub async fn shutdown(self) {
        _ = self.shutdown.send_replace(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "batch worker terminated abnormally");
            }
        }
        tracing::info!("batch workers stopped");
    }
}
