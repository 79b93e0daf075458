//! Metrics collection utilities for httptap
//!
//! This module provides pipeline counters shared between the capture thread
//! and the embedder.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the capture-to-message pipeline.
///
/// All counters are relaxed atomics; they are informational and carry no
/// ordering guarantees relative to message delivery.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    frames_seen: AtomicU64,
    segments_decoded: AtomicU64,
    chunks_delivered: AtomicU64,
    messages_emitted: AtomicU64,
    connections_evicted: AtomicU64,
    sink_overflow: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment(&self) {
        self.segments_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.connections_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_overflow(&self) {
        self.sink_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen.load(Ordering::Relaxed)
    }

    pub fn segments_decoded(&self) -> u64 {
        self.segments_decoded.load(Ordering::Relaxed)
    }

    pub fn chunks_delivered(&self) -> u64 {
        self.chunks_delivered.load(Ordering::Relaxed)
    }

    pub fn messages_emitted(&self) -> u64 {
        self.messages_emitted.load(Ordering::Relaxed)
    }

    pub fn connections_evicted(&self) -> u64 {
        self.connections_evicted.load(Ordering::Relaxed)
    }

    pub fn sink_overflow(&self) -> u64 {
        self.sink_overflow.load(Ordering::Relaxed)
    }
}
