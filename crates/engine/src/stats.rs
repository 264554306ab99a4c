// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Lock-free pipeline counters.

use crate::batch::CloseReason;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters shared by the receiver side and the worker pool.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    parse_errors: AtomicU64,
    batches_delivered: AtomicU64,
    batches_failed: AtomicU64,
    full_closes: AtomicU64,
    timeout_closes: AtomicU64,
    shutdown_closes: AtomicU64,
    open_batches: AtomicUsize,
    peak_open_batches: AtomicUsize,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages handed to the pipeline by broker connections.
    pub received: u64,
    /// Messages acknowledged.
    pub acked: u64,
    /// Messages negatively acknowledged, for any reason.
    pub nacked: u64,
    /// Messages that failed to parse.
    pub parse_errors: u64,
    /// Batches accepted by the sink.
    pub batches_delivered: u64,
    /// Batches rejected by the sink.
    pub batches_failed: u64,
    /// Batches closed because they were full.
    pub full_closes: u64,
    /// Batches closed because their deadline elapsed.
    pub timeout_closes: u64,
    /// Batches closed by shutdown.
    pub shutdown_closes: u64,
    /// Batches currently open.
    pub open_batches: usize,
    /// Highest number of simultaneously open batches.
    pub peak_open_batches: usize,
}

impl PipelineStats {
    pub(crate) fn record_received(&self) {
        _ = self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self, count: usize) {
        _ = self.acked.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_nacked(&self, count: usize) {
        _ = self.nacked.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_parse_error(&self) {
        _ = self.parse_errors.fetch_add(1, Ordering::Relaxed);
        self.record_nacked(1);
    }

    pub(crate) fn record_batch_opened(&self) {
        let open = self.open_batches.fetch_add(1, Ordering::AcqRel) + 1;
        _ = self.peak_open_batches.fetch_max(open, Ordering::AcqRel);
    }

    pub(crate) fn record_batch_closed(&self, reason: CloseReason) {
        _ = self.open_batches.fetch_sub(1, Ordering::AcqRel);
        let counter = match reason {
            CloseReason::Full => &self.full_closes,
            CloseReason::Timeout => &self.timeout_closes,
            CloseReason::Shutdown => &self.shutdown_closes,
        };
        _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_outcome(&self, delivered: bool, size: usize) {
        if delivered {
            _ = self.batches_delivered.fetch_add(1, Ordering::Relaxed);
            self.record_acked(size);
        } else {
            _ = self.batches_failed.fetch_add(1, Ordering::Relaxed);
            self.record_nacked(size);
        }
    }

    /// Takes a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            full_closes: self.full_closes.load(Ordering::Relaxed),
            timeout_closes: self.timeout_closes.load(Ordering::Relaxed),
            shutdown_closes: self.shutdown_closes.load(Ordering::Relaxed),
            open_batches: self.open_batches.load(Ordering::Acquire),
            peak_open_batches: self.peak_open_batches.load(Ordering::Acquire),
        }
    }
}

impl StatsSnapshot {
    /// Messages settled either way.
    #[must_use]
    pub const fn settled(&self) -> u64 {
        self.acked + self.nacked
    }
}
