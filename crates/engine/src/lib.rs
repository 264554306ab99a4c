// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Handoff, flow control and batching core of the subflow subscription source.
//!
//! ```text
//!   broker ──► MessageReceiver ──► handoff (capacity 0) ──► BatchWorker × N ──► BatchSink
//!     ▲              │                                           │
//!     │        FlowController                                    │
//!     └──────────── ack / nack ◄─────────────────────────────────┘
//! ```
//!
//! - [`flow_control`]: shared outstanding-message budget.
//! - [`handoff`]: zero-capacity rendezvous between broker callbacks and workers.
//! - [`worker`]: fixed pool of workers, each owning one open batch.
//! - [`receiver`]: adapter invoked by broker connections for every delivery.
//! - [`pipeline`]: startup / run / ordered shutdown.
//! - [`in_memory`]: process-local broker used by tests, benches and the demo binary.

pub mod batch;
pub mod error;
pub mod flow_control;
pub mod handoff;
pub mod in_memory;
pub mod message;
pub mod parser;
pub mod pipeline;
pub mod receiver;
pub mod sink;
pub mod stats;
pub mod subscriber;
pub mod worker;

#[cfg(test)]
mod tests;

pub use error::PipelineError;
pub use flow_control::{FlowControlError, FlowControlSettings, FlowController, FlowPermit};
pub use handoff::{
    AcceptError, HandoffError, HandoffReceiver, HandoffSender, PendingOutcome, WorkItem,
    handoff_channel,
};
pub use message::{AckHandle, AckReplyConsumer, Message, MessageId, NackCause, Outcome};
pub use parser::{FormatParser, JsonParser, ParseError, Record, RecordParser, TextParser};
pub use pipeline::{Pipeline, PipelineSettings, StopSignal};
pub use receiver::{MessageReceiver, ReceiveError};
pub use sink::{BatchSink, LoggingSink, SinkError};
pub use stats::{PipelineStats, StatsSnapshot};
pub use subscriber::{
    FailureListener, Subscriber, SubscriberBuilder, SubscriberError, SubscriberFailure,
};
pub use worker::{WorkerPool, WorkerSettings};
