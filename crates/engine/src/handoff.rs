// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Zero-capacity rendezvous between broker callbacks and batch workers.
//!
//! The channel is a `flume::bounded(0)`: `handoff` completes only once a worker
//! has taken the item, so a busy worker pool stalls the broker callback
//! instead of letting unsettled messages pile up in a buffer. Both ends are
//! cloneable (multi-producer, multi-consumer) and each item reaches exactly
//! one worker.
//!
//! A worker whose bounded wait times out does not lose an item: flume only
//! moves an item once a receive actually completes.

use crate::flow_control::FlowPermit;
use crate::message::{Message, NackCause, Outcome};
use crate::stats::PipelineStats;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A message in transit from a receiver to a worker.
///
/// Dropping an unsettled item nacks it with [`NackCause::Abandoned`].
pub struct WorkItem {
    message: Message,
    completion: Completion,
}

impl WorkItem {
    /// Pairs a message with its budget share and returns the outcome handle
    /// the receiving side can await.
    #[must_use]
    pub fn new(message: Message, permit: FlowPermit) -> (Self, PendingOutcome) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                message,
                completion: Completion {
                    permit: Some(permit),
                    reply: Some(reply),
                    stats: None,
                },
            },
            PendingOutcome { rx },
        )
    }

    /// Counts an abandoned settlement of this item as a nack in `stats`.
    pub(crate) fn counted_in(mut self, stats: Arc<PipelineStats>) -> Self {
        self.completion.stats = Some(stats);
        self
    }

    /// The carried message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Acknowledges the message, releases its budget and reports the outcome.
    pub fn ack(self) {
        self.resolve(Outcome::Ack);
    }

    /// Nacks the message, releases its budget and reports the outcome.
    pub fn nack(self, cause: NackCause, reason: impl Into<String>) {
        self.resolve(Outcome::nack(cause, reason));
    }

    /// Settles the message with `outcome`.
    pub fn resolve(self, outcome: Outcome) {
        let WorkItem {
            message,
            completion,
        } = self;
        if outcome.is_ack() {
            message.ack();
        } else {
            message.nack();
        }
        completion.complete(outcome);
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("message_id", self.message.id())
            .finish()
    }
}

/// Budget share and outcome reply of a [`WorkItem`].
///
/// Dropped after the message on abandonment, so the broker sees the nack
/// before the budget is released.
struct Completion {
    permit: Option<FlowPermit>,
    reply: Option<oneshot::Sender<Outcome>>,
    stats: Option<Arc<PipelineStats>>,
}

impl Completion {
    fn complete(mut self, outcome: Outcome) {
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
        if let Some(reply) = self.reply.take() {
            let _ignore_closed = reply.send(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        if let Some(stats) = &self.stats {
            stats.record_nacked(1);
        }
        drop(self.permit.take());
        let _ignore_closed = reply.send(Outcome::nack(
            NackCause::Abandoned,
            "work item dropped before settlement",
        ));
    }
}

/// Outcome of a handed-off message, resolved once its batch settles.
#[derive(Debug)]
pub struct PendingOutcome {
    rx: oneshot::Receiver<Outcome>,
}

impl PendingOutcome {
    /// Waits for the message to be settled.
    ///
    /// A work item dropped without settlement is reported as
    /// [`NackCause::Abandoned`].
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or_else(|_| {
            Outcome::nack(NackCause::Abandoned, "work item dropped before settlement")
        })
    }
}

/// Error returned when no worker can ever accept an item.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// Every worker is gone; the item is handed back so the caller can nack it.
    #[error("no batch worker is accepting work")]
    Closed(WorkItem),
}

/// Error returned by the worker side of the handoff.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    /// Every handoff sender is gone; no further items can arrive.
    #[error("handoff channel closed")]
    Closed,
    /// The deadline elapsed before an item arrived.
    #[error("deadline elapsed before an item was handed off")]
    TimedOut,
}

/// Creates a connected handoff pair with zero buffering.
#[must_use]
pub fn handoff_channel() -> (HandoffSender, HandoffReceiver) {
    let (sender, receiver) = flume::bounded(0);
    (HandoffSender { sender }, HandoffReceiver { receiver })
}

/// Receiver-side end of the handoff.
#[derive(Clone)]
pub struct HandoffSender {
    sender: flume::Sender<WorkItem>,
}

impl HandoffSender {
    /// Waits until a worker takes `item`.
    pub async fn handoff(&self, item: WorkItem) -> Result<(), HandoffError> {
        self.sender
            .send_async(item)
            .await
            .map_err(|flume::SendError(item)| HandoffError::Closed(item))
    }

    /// Blocking variant of [`handoff`](Self::handoff) for broker callbacks that
    /// run on their own (non-async) threads.
    pub fn handoff_blocking(&self, item: WorkItem) -> Result<(), HandoffError> {
        self.sender
            .send(item)
            .map_err(|flume::SendError(item)| HandoffError::Closed(item))
    }
}

/// Worker-side end of the handoff.
#[derive(Clone)]
pub struct HandoffReceiver {
    receiver: flume::Receiver<WorkItem>,
}

impl HandoffReceiver {
    /// Waits without bound for the next item.
    pub async fn accept(&self) -> Result<WorkItem, AcceptError> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| AcceptError::Closed)
    }

    /// Waits for the next item until `deadline`.
    pub async fn accept_until(&self, deadline: Instant) -> Result<WorkItem, AcceptError> {
        match tokio::time::timeout_at(deadline, self.receiver.recv_async()).await {
            Ok(Ok(item)) => Ok(item),
            Ok(Err(_)) => Err(AcceptError::Closed),
            Err(_) => Err(AcceptError::TimedOut),
        }
    }

    /// Takes an item only if a sender is already waiting.
    pub fn try_accept(&self) -> Option<WorkItem> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::{FlowControlSettings, FlowController};
    use crate::message::{AckHandle, AckReplyConsumer};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use subflow_config::LimitExceededBehavior;

    #[derive(Default)]
    struct Settlements {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    struct CountingReply(Arc<Settlements>);

    impl AckReplyConsumer for CountingReply {
        fn ack(self: Box<Self>) {
            _ = self.0.acks.fetch_add(1, Ordering::SeqCst);
        }

        fn nack(self: Box<Self>) {
            _ = self.0.nacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn work_item(
        id: &str,
        flow: &Arc<FlowController>,
        settlements: &Arc<Settlements>,
    ) -> (WorkItem, PendingOutcome) {
        let message = Message::new(
            id,
            id.as_bytes().to_vec(),
            AckHandle::new(CountingReply(Arc::clone(settlements))),
        );
        let permit = flow.acquire(1).await.expect("permit");
        WorkItem::new(message, permit)
    }

    fn flow() -> Arc<FlowController> {
        Arc::new(FlowController::new(FlowControlSettings {
            max_outstanding: 16,
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }))
    }

    /// Scenario:
    /// 1. Given a handoff channel with no worker waiting.
    /// 2. When a receiver hands off an item.
    /// 3. Then the handoff stays pending until a worker accepts it.
    #[tokio::test(flavor = "current_thread")]
    async fn handoff_blocks_until_a_worker_accepts() {
        let (sender, receiver) = handoff_channel();
        let flow = flow();
        let settlements = Arc::new(Settlements::default());
        let (item, _outcome) = work_item("m1", &flow, &settlements).await;

        let sending = tokio::spawn(async move { sender.handoff(item).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !sending.is_finished(),
            "rendezvous must not complete without an acceptor"
        );

        let accepted = receiver.accept().await.expect("item should be accepted");
        assert_eq!(accepted.message().id().as_str(), "m1");
        sending
            .await
            .expect("task should not panic")
            .expect("handoff should complete");
        accepted.ack();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn accept_until_times_out_without_items() {
        let (_sender, receiver) = handoff_channel();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(
            receiver.accept_until(deadline).await.expect_err("no item"),
            AcceptError::TimedOut
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn accept_reports_closed_when_senders_are_gone() {
        let (sender, receiver) = handoff_channel();
        drop(sender);
        assert_eq!(
            receiver.accept().await.expect_err("closed"),
            AcceptError::Closed
        );
    }

    /// Scenario:
    /// 1. Given a handoff channel whose workers are all gone.
    /// 2. When a receiver hands off an item.
    /// 3. Then the item comes back in the error and can still be nacked.
    #[tokio::test(flavor = "current_thread")]
    async fn closed_handoff_returns_the_item() {
        let (sender, receiver) = handoff_channel();
        drop(receiver);
        let flow = flow();
        let settlements = Arc::new(Settlements::default());
        let (item, outcome) = work_item("m1", &flow, &settlements).await;
        assert_eq!(flow.outstanding(), 1);

        let HandoffError::Closed(item) = sender.handoff(item).await.expect_err("closed");
        item.nack(NackCause::PipelineClosed, "no workers");

        assert_eq!(settlements.nacks.load(Ordering::SeqCst), 1);
        assert_eq!(settlements.acks.load(Ordering::SeqCst), 0);
        assert_eq!(flow.outstanding(), 0);
        assert!(matches!(
            outcome.wait().await,
            Outcome::Nack {
                cause: NackCause::PipelineClosed,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropped_work_item_is_nacked_and_released() {
        let flow = flow();
        let settlements = Arc::new(Settlements::default());
        let (item, outcome) = work_item("m1", &flow, &settlements).await;
        drop(item);

        assert_eq!(settlements.nacks.load(Ordering::SeqCst), 1);
        assert_eq!(flow.outstanding(), 0);
        assert!(matches!(
            outcome.wait().await,
            Outcome::Nack {
                cause: NackCause::Abandoned,
                ..
            }
        ));
    }

    /// Scenario:
    /// 1. Given several workers racing on one handoff channel.
    /// 2. When many concurrent receivers hand off distinct items.
    /// 3. Then every item is accepted by exactly one worker.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn each_item_reaches_exactly_one_worker() {
        let (sender, receiver) = handoff_channel();
        let flow = flow();
        let settlements = Arc::new(Settlements::default());

        let mut workers = Vec::new();
        for _ in 0..3 {
            let receiver = receiver.clone();
            workers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(item) = receiver.accept().await {
                    seen.push(item.message().id().clone());
                    item.ack();
                }
                seen
            }));
        }
        drop(receiver);

        let mut producers = Vec::new();
        for p in 0..4 {
            let sender = sender.clone();
            let flow = Arc::clone(&flow);
            let settlements = Arc::clone(&settlements);
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    let (item, _outcome) =
                        work_item(&format!("p{p}-m{i}"), &flow, &settlements).await;
                    sender.handoff(item).await.expect("workers are running");
                }
            }));
        }
        drop(sender);
        for producer in producers {
            producer.await.expect("producer should not panic");
        }

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await.expect("worker should not panic"));
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 200);
        assert_eq!(all.len(), 200, "no item may be accepted twice");
        assert_eq!(settlements.acks.load(Ordering::SeqCst), 200);
        assert_eq!(flow.outstanding(), 0);
    }

    /// Scenario:
    /// 1. Given async workers racing on one handoff channel.
    /// 2. When several OS threads hand off items with the blocking variant.
    /// 3. Then every item is accepted by exactly one worker.
    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn blocking_handoff_from_threads_reaches_exactly_one_worker() {
        let (sender, receiver) = handoff_channel();
        let flow = Arc::new(FlowController::new(FlowControlSettings {
            max_outstanding: 100,
            limit_exceeded_behavior: LimitExceededBehavior::Reject,
        }));
        let settlements = Arc::new(Settlements::default());

        let mut workers = Vec::new();
        for _ in 0..3 {
            let receiver = receiver.clone();
            workers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(item) = receiver.accept().await {
                    seen.push(item.message().id().clone());
                    item.ack();
                }
                seen
            }));
        }
        drop(receiver);

        let mut threads = Vec::new();
        for t in 0..4 {
            let mut items = Vec::new();
            for i in 0..25 {
                let (item, _outcome) = work_item(&format!("t{t}-m{i}"), &flow, &settlements).await;
                items.push(item);
            }
            let sender = sender.clone();
            threads.push(std::thread::spawn(move || {
                for item in items {
                    sender.handoff_blocking(item).expect("workers are running");
                }
            }));
        }
        drop(sender);
        for thread in threads {
            thread.join().expect("producer thread should not panic");
        }

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await.expect("worker should not panic"));
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 100);
        assert_eq!(all.len(), 100, "no item may be accepted twice");
        assert_eq!(settlements.acks.load(Ordering::SeqCst), 100);
        assert_eq!(flow.outstanding(), 0);
    }
}
