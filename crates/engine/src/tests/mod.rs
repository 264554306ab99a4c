// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Pipeline-level scenarios driven through a capturing broker connection.

use crate::flow_control::FlowControlSettings;
use crate::handoff::PendingOutcome;
use crate::message::{AckHandle, AckReplyConsumer, Message};
use crate::parser::Record;
use crate::receiver::{MessageReceiver, ReceiveError};
use crate::sink::{BatchSink, SinkError};
use crate::subscriber::{FailureListener, Subscriber, SubscriberBuilder, SubscriberError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use subflow_config::{SourceConfig, SubscriptionName};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) fn config(max_batch_size: usize, max_wait_time_ms: u64, workers: usize) -> SourceConfig {
    let mut config = SourceConfig::new(
        SubscriptionName::parse("events").expect("subscription name should be valid"),
    );
    config.basic.max_batch_size = max_batch_size;
    config.basic.max_wait_time_ms = max_wait_time_ms;
    config.max_threads = workers;
    config
}

/// Per-message ack/nack counts observed on the broker side.
#[derive(Default)]
pub(crate) struct Ledger {
    settlements: Mutex<HashMap<String, (u32, u32)>>,
}

struct LedgerReply {
    id: String,
    ledger: Arc<Ledger>,
}

impl AckReplyConsumer for LedgerReply {
    fn ack(self: Box<Self>) {
        self.ledger.settlements.lock().entry(self.id.clone()).or_default().0 += 1;
    }

    fn nack(self: Box<Self>) {
        self.ledger.settlements.lock().entry(self.id.clone()).or_default().1 += 1;
    }
}

impl Ledger {
    pub(crate) fn message(self: &Arc<Self>, id: &str, payload: impl Into<bytes::Bytes>) -> Message {
        Message::new(
            id,
            payload,
            AckHandle::new(LedgerReply {
                id: id.to_owned(),
                ledger: Arc::clone(self),
            }),
        )
    }

    pub(crate) fn acks(&self, id: &str) -> u32 {
        self.settlements.lock().get(id).map_or(0, |s| s.0)
    }

    pub(crate) fn nacks(&self, id: &str) -> u32 {
        self.settlements.lock().get(id).map_or(0, |s| s.1)
    }

    /// Asserts that each of `ids` was settled exactly once.
    pub(crate) fn assert_settled_once<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let settlements = self.settlements.lock();
        for id in ids {
            let (acks, nacks) = settlements.get(id).copied().unwrap_or_default();
            assert_eq!(acks + nacks, 1, "{id} settled {acks} ack(s) and {nacks} nack(s)");
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DeliveredBatch {
    pub(crate) at: Instant,
    pub(crate) message_ids: Vec<String>,
    pub(crate) records: usize,
}

/// Sink recording every batch, optionally failing chosen batches and taking
/// time to process each one.
#[derive(Default)]
pub(crate) struct RecordingSink {
    batches: Mutex<Vec<DeliveredBatch>>,
    failing: Mutex<HashSet<usize>>,
    delay: Duration,
}

impl RecordingSink {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Makes the `index`-th delivered batch (0-based) fail.
    pub(crate) fn fail_batch(&self, index: usize) {
        _ = self.failing.lock().insert(index);
    }

    pub(crate) fn batches(&self) -> Vec<DeliveredBatch> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl BatchSink<Record> for RecordingSink {
    async fn deliver(&self, records: Vec<Record>) -> Result<(), SinkError> {
        let mut message_ids: Vec<String> = records
            .iter()
            .map(|r| r.message_id.as_str().to_owned())
            .collect();
        message_ids.dedup();
        let index = {
            let mut batches = self.batches.lock();
            batches.push(DeliveredBatch {
                at: Instant::now(),
                message_ids,
                records: records.len(),
            });
            batches.len() - 1
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().contains(&index) {
            return Err(SinkError::Unavailable {
                reason: format!("batch {index} refused"),
            });
        }
        Ok(())
    }
}

/// Broker connection double that hands its receiver and failure listener to
/// the test.
#[derive(Default)]
pub(crate) struct CapturingBuilder {
    connections: Mutex<Vec<(MessageReceiver, FailureListener, FlowControlSettings)>>,
    fail_start_on: Option<usize>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl CapturingBuilder {
    pub(crate) fn failing_on(connection: usize) -> Self {
        Self {
            fail_start_on: Some(connection),
            ..Self::default()
        }
    }

    pub(crate) fn receiver(&self, connection: usize) -> MessageReceiver {
        self.connections.lock()[connection].0.clone()
    }

    pub(crate) fn failures(&self, connection: usize) -> FailureListener {
        self.connections.lock()[connection].1.clone()
    }

    pub(crate) fn flow_control(&self, connection: usize) -> FlowControlSettings {
        self.connections.lock()[connection].2
    }

    pub(crate) fn built(&self) -> usize {
        self.connections.lock().len()
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct CapturedSubscriber {
    fail_start: bool,
    running: bool,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscriber for CapturedSubscriber {
    async fn start(&mut self) -> Result<(), SubscriberError> {
        if self.fail_start {
            return Err(SubscriberError::StartFailed {
                reason: "connection refused".to_owned(),
            });
        }
        self.running = true;
        _ = self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SubscriberError> {
        if std::mem::take(&mut self.running) {
            _ = self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl SubscriberBuilder for CapturingBuilder {
    fn build(
        &self,
        connection: usize,
        receiver: MessageReceiver,
        flow_control: FlowControlSettings,
        failures: FailureListener,
    ) -> Result<Box<dyn Subscriber>, SubscriberError> {
        self.connections
            .lock()
            .push((receiver, failures, flow_control));
        Ok(Box::new(CapturedSubscriber {
            fail_start: self.fail_start_on == Some(connection),
            running: false,
            starts: Arc::clone(&self.starts),
            stops: Arc::clone(&self.stops),
        }))
    }
}

/// Delivers `id` through `receiver` at `origin + at_ms`.
pub(crate) fn deliver_at(
    receiver: &MessageReceiver,
    ledger: &Arc<Ledger>,
    id: &str,
    origin: Instant,
    at_ms: u64,
) -> JoinHandle<Result<PendingOutcome, ReceiveError>> {
    let receiver = receiver.clone();
    let message = ledger.message(id, id.to_owned());
    tokio::spawn(async move {
        tokio::time::sleep_until(origin + Duration::from_millis(at_ms)).await;
        receiver.receive(message).await
    })
}
