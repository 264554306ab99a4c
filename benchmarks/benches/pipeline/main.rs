// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for the rendezvous handoff and the full pipeline compared to
//! the underlying channel primitive.
//!
//! Scenarios:
//! - flume rendezvous vs handoff with flow control and ack tokens
//! - end-to-end pipeline over the in-memory broker for 1, 2 and 4 workers

#![allow(missing_docs)]

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use subflow_config::{DataFormat, LimitExceededBehavior, SourceConfig, SubscriptionName};
use subflow_engine::in_memory::InMemoryBroker;
use subflow_engine::{
    AckHandle, AckReplyConsumer, BatchSink, FlowControlSettings, FlowController, FormatParser,
    Message, Pipeline, PipelineSettings, Record, SinkError, WorkItem, handoff_channel,
};

const HANDOFF_MSG_COUNT: usize = 20_000;
const PIPELINE_MSG_COUNT: usize = 10_000;

struct NoopReply;

impl AckReplyConsumer for NoopReply {
    fn ack(self: Box<Self>) {}
    fn nack(self: Box<Self>) {}
}

struct DiscardSink;

#[async_trait]
impl BatchSink<Record> for DiscardSink {
    async fn deliver(&self, records: Vec<Record>) -> Result<(), SinkError> {
        _ = black_box(records.len());
        Ok(())
    }
}

async fn run_flume_rendezvous(msg_count: usize) {
    let (tx, rx) = flume::bounded::<u64>(0);
    let consumer = tokio::spawn(async move {
        let mut checksum = 0u64;
        for _ in 0..msg_count {
            checksum ^= rx.recv_async().await.expect("sender should remain open");
        }
        _ = black_box(checksum);
    });
    for i in 0..msg_count {
        tx.send_async(i as u64)
            .await
            .expect("receiver should remain open");
    }
    consumer.await.expect("consumer task should complete");
}

async fn run_handoff(msg_count: usize) {
    let (tx, rx) = handoff_channel();
    let flow = Arc::new(FlowController::new(FlowControlSettings {
        max_outstanding: 64,
        limit_exceeded_behavior: LimitExceededBehavior::Block,
    }));
    let consumer = tokio::spawn(async move {
        for _ in 0..msg_count {
            rx.accept().await.expect("sender should remain open").ack();
        }
    });
    for i in 0..msg_count {
        let message = Message::new(format!("m{i}"), "payload", AckHandle::new(NoopReply));
        let permit = flow.acquire(1).await.expect("permit");
        let (item, outcome) = WorkItem::new(message, permit);
        tx.handoff(item).await.expect("worker should remain open");
        drop(black_box(outcome));
    }
    consumer.await.expect("consumer task should complete");
}

async fn run_pipeline(msg_count: usize, workers: usize) {
    let mut config = SourceConfig::new(SubscriptionName::from("bench"));
    config.data_format = DataFormat::Text;
    config.basic.max_batch_size = 100;
    config.basic.max_wait_time_ms = 5;
    config.max_threads = workers;

    let broker = InMemoryBroker::new();
    broker.create_subscription(&config.subscription);
    for i in 0..msg_count {
        _ = broker
            .publish(&config.subscription, format!("event {i}"))
            .expect("publish should succeed");
    }
    let pipeline = Pipeline::start(
        &config,
        FormatParser::from_config(&config),
        DiscardSink,
        &broker.subscriber_builder(&config.subscription),
        PipelineSettings::default(),
    )
    .await
    .expect("pipeline should start");
    while !broker.is_drained(&config.subscription) {
        tokio::time::sleep(Duration::from_micros(200)).await;
    }
    _ = black_box(pipeline.shutdown().await);
}

fn bench_handoff_vs_flume(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build Tokio runtime");

    let mut group = c.benchmark_group("handoff");
    _ = group.throughput(Throughput::Elements(HANDOFF_MSG_COUNT as u64));

    _ = group.bench_function("flume_rendezvous_baseline", |b| {
        b.to_async(&rt).iter(|| run_flume_rendezvous(HANDOFF_MSG_COUNT));
    });

    _ = group.bench_function("handoff_with_flow_control", |b| {
        b.to_async(&rt).iter(|| run_handoff(HANDOFF_MSG_COUNT));
    });

    group.finish();
}

fn bench_pipeline_workers(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build Tokio runtime");

    let mut group = c.benchmark_group("pipeline");
    _ = group.throughput(Throughput::Elements(PIPELINE_MSG_COUNT as u64));
    _ = group.sample_size(10);

    for workers in [1, 2, 4] {
        _ = group.bench_with_input(
            BenchmarkId::new("in_memory", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt)
                    .iter(|| run_pipeline(PIPELINE_MSG_COUNT, workers));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_handoff_vs_flume, bench_pipeline_workers);
criterion_main!(benches);
