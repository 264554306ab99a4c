// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

use super::subscriber::InMemorySubscriberBuilder;
use crate::message::{AckReplyConsumer, MessageId};
use crate::subscriber::SubscriberError;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use subflow_config::SubscriptionName;
use tokio::sync::{OwnedSemaphorePermit, watch};

/// A published message waiting for (re)delivery.
#[derive(Debug, Clone)]
pub(super) struct Delivery {
    pub(super) id: MessageId,
    pub(super) payload: Bytes,
    pub(super) attributes: BTreeMap<String, String>,
    pub(super) attempt: u32,
}

/// Per-subscription delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Messages published.
    pub published: u64,
    /// Deliveries made, redeliveries included.
    pub delivered: u64,
    /// Acks received.
    pub acked: u64,
    /// Nacks received.
    pub nacked: u64,
    /// Messages waiting for delivery.
    pub backlog: usize,
    /// Delivered messages not yet settled.
    pub in_flight: usize,
}

pub(super) struct SubscriptionState {
    name: SubscriptionName,
    backlog_tx: flume::Sender<Delivery>,
    pub(super) backlog_rx: flume::Receiver<Delivery>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    in_flight: AtomicUsize,
    settlements: Mutex<HashMap<MessageId, (u32, u32)>>,
    failure: watch::Sender<Option<String>>,
}

impl SubscriptionState {
    fn new(name: SubscriptionName) -> Self {
        let (backlog_tx, backlog_rx) = flume::unbounded();
        let (failure, _) = watch::channel(None);
        Self {
            name,
            backlog_tx,
            backlog_rx,
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            settlements: Mutex::new(HashMap::new()),
            failure,
        }
    }

    pub(super) fn name(&self) -> &SubscriptionName {
        &self.name
    }

    fn enqueue(&self, delivery: Delivery) {
        // The state owns a receiver, so the backlog never disconnects.
        let _ignore_closed = self.backlog_tx.send(delivery);
    }

    pub(super) fn mark_delivered(&self) {
        _ = self.in_flight.fetch_add(1, Ordering::AcqRel);
        _ = self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn settle(&self, delivery: Delivery, acked: bool) {
        {
            let mut settlements = self.settlements.lock();
            let entry = settlements.entry(delivery.id.clone()).or_default();
            if acked {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
        if acked {
            _ = self.acked.fetch_add(1, Ordering::Relaxed);
        } else {
            _ = self.nacked.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                subscription = %self.name,
                message_id = %delivery.id,
                attempt = delivery.attempt,
                "message nacked, scheduling redelivery"
            );
            self.enqueue(Delivery {
                attempt: delivery.attempt.saturating_add(1),
                ..delivery
            });
        }
        _ = self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(super) fn failure(&self) -> watch::Receiver<Option<String>> {
        self.failure.subscribe()
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            backlog: self.backlog_rx.len(),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }
}

/// Ack token of one in-memory delivery.
///
/// Holds the connection's outstanding permit until settled.
pub(super) struct InMemoryReply {
    pub(super) state: Arc<SubscriptionState>,
    pub(super) delivery: Delivery,
    pub(super) _permit: OwnedSemaphorePermit,
}

impl AckReplyConsumer for InMemoryReply {
    fn ack(self: Box<Self>) {
        let Self {
            state, delivery, ..
        } = *self;
        state.settle(delivery, true);
    }

    fn nack(self: Box<Self>) {
        let Self {
            state, delivery, ..
        } = *self;
        state.settle(delivery, false);
    }
}

#[derive(Default)]
struct BrokerState {
    subscriptions: HashMap<SubscriptionName, Arc<SubscriptionState>>,
}

/// Process-local broker holding named subscriptions.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a broker with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `name` if it does not exist yet.
    pub fn create_subscription(&self, name: &SubscriptionName) {
        let mut state = self.state.write();
        _ = state
            .subscriptions
            .entry(name.clone())
            .or_insert_with(|| Arc::new(SubscriptionState::new(name.clone())));
    }

    pub(super) fn subscription(
        &self,
        name: &SubscriptionName,
    ) -> Result<Arc<SubscriptionState>, SubscriberError> {
        self.state
            .read()
            .subscriptions
            .get(name)
            .cloned()
            .ok_or_else(|| SubscriberError::SubscriptionNotFound {
                subscription: name.to_string(),
            })
    }

    /// Publishes a payload without attributes.
    pub fn publish(
        &self,
        subscription: &SubscriptionName,
        payload: impl Into<Bytes>,
    ) -> Result<MessageId, SubscriberError> {
        self.publish_with_attributes(subscription, payload, BTreeMap::new())
    }

    /// Publishes a payload with broker attributes.
    pub fn publish_with_attributes(
        &self,
        subscription: &SubscriptionName,
        payload: impl Into<Bytes>,
        attributes: BTreeMap<String, String>,
    ) -> Result<MessageId, SubscriberError> {
        let state = self.subscription(subscription)?;
        let sequence = state.next_id.fetch_add(1, Ordering::Relaxed);
        let id = MessageId::new(format!("{subscription}-{sequence}"));
        _ = state.published.fetch_add(1, Ordering::Relaxed);
        state.enqueue(Delivery {
            id: id.clone(),
            payload: payload.into(),
            attributes,
            attempt: 1,
        });
        Ok(id)
    }

    /// Delivery counters of a subscription.
    #[must_use]
    pub fn subscription_stats(&self, subscription: &SubscriptionName) -> Option<SubscriptionStats> {
        self.subscription(subscription).ok().map(|state| state.stats())
    }

    /// Number of acks received for `id`.
    #[must_use]
    pub fn acks_for(&self, subscription: &SubscriptionName, id: &MessageId) -> u32 {
        self.settlements_for(subscription, id).0
    }

    /// Number of nacks received for `id`.
    #[must_use]
    pub fn nacks_for(&self, subscription: &SubscriptionName, id: &MessageId) -> u32 {
        self.settlements_for(subscription, id).1
    }

    fn settlements_for(&self, subscription: &SubscriptionName, id: &MessageId) -> (u32, u32) {
        self.subscription(subscription)
            .ok()
            .and_then(|state| state.settlements.lock().get(id).copied())
            .unwrap_or_default()
    }

    /// Returns `true` once every published message has been acked and nothing
    /// is waiting for delivery or settlement.
    #[must_use]
    pub fn is_drained(&self, subscription: &SubscriptionName) -> bool {
        self.subscription_stats(subscription).is_some_and(|stats| {
            stats.backlog == 0 && stats.in_flight == 0 && stats.acked >= stats.published
        })
    }

    /// Makes every running connection of `subscription` report `reason` as an
    /// unrecoverable failure.
    pub fn fail_connections(
        &self,
        subscription: &SubscriptionName,
        reason: impl Into<String>,
    ) -> Result<(), SubscriberError> {
        let state = self.subscription(subscription)?;
        _ = state.failure.send_replace(Some(reason.into()));
        Ok(())
    }

    /// Builder connecting pipelines to `subscription`.
    #[must_use]
    pub fn subscriber_builder(&self, subscription: &SubscriptionName) -> InMemorySubscriberBuilder {
        InMemorySubscriberBuilder::new(self.clone(), subscription.clone())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("InMemoryBroker")
            .field(
                "subscriptions",
                &state.subscriptions.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}
