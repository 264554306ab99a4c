// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Process-local broker backend.
//!
//! Design notes:
//! - Each subscription keeps one unbounded backlog (`flume`) shared by all of
//!   its connections, so every published message goes to exactly one
//!   connection at a time.
//! - A connection caps its unsettled deliveries with a Tokio semaphore sized to
//!   the pipeline's `max_outstanding`; the permit travels with the ack token.
//! - `num_threads_per_subscriber` delivery loops run per connection. Each loop
//!   invokes the pipeline receiver and waits for it to return, which is how the
//!   handoff stalls delivery.
//!
//! Ack/Nack behavior:
//! - `ack()` settles the message for good.
//! - `nack()` (including an ack token dropped unsettled) puts the message back
//!   on the backlog with its delivery attempt incremented.
//!
//! Failure injection: [`InMemoryBroker::fail_connections`] makes every running
//! connection of a subscription report an unrecoverable failure.

mod broker;
mod subscriber;

pub use broker::{InMemoryBroker, SubscriptionStats};
pub use subscriber::{InMemorySubscriber, InMemorySubscriberBuilder};

#[cfg(test)]
mod tests;
