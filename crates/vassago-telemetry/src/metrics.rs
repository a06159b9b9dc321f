//! Counters for ingestion and retrieval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Counters shared by the ingestion and retrieval pipelines.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    documents_ingested: AtomicU64,
    documents_partial: AtomicU64,
    chunks_stored: AtomicU64,
    chunks_unchanged: AtomicU64,
    chunks_failed: AtomicU64,
    embed_calls: AtomicU64,
    queries_answered: AtomicU64,
    queries_without_context: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Documents whose ingestion completed.
    pub documents_ingested: u64,
    /// Documents left partially ingested.
    pub documents_partial: u64,
    /// Chunks embedded and written.
    pub chunks_stored: u64,
    /// Chunks skipped because their content was already stored.
    pub chunks_unchanged: u64,
    /// Chunks that failed.
    pub chunks_failed: u64,
    /// Calls made to the embedding provider.
    pub embed_calls: u64,
    /// Questions answered.
    pub queries_answered: u64,
    /// Questions with no relevant context.
    pub queries_without_context: u64,
    /// Other failures.
    pub errors: u64,
}

impl PipelineMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished document run.
    pub fn record_document(&self, complete: bool) {
        if complete {
            self.documents_ingested.fetch_add(1, Ordering::Relaxed);
        } else {
            self.documents_partial.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a stored chunk.
    pub fn record_chunk_stored(&self) {
        self.chunks_stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a chunk skipped as unchanged.
    pub fn record_chunk_unchanged(&self) {
        self.chunks_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed chunk.
    pub fn record_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records embedding provider calls.
    pub fn record_embed_calls(&self, calls: u64) {
        self.embed_calls.fetch_add(calls, Ordering::Relaxed);
    }

    /// Records an answered question.
    pub fn record_answer(&self) {
        self.queries_answered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a question with no relevant context.
    pub fn record_no_context(&self) {
        self.queries_without_context.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            documents_partial: self.documents_partial.load(Ordering::Relaxed),
            chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            chunks_unchanged: self.chunks_unchanged.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            embed_calls: self.embed_calls.load(Ordering::Relaxed),
            queries_answered: self.queries_answered.load(Ordering::Relaxed),
            queries_without_context: self.queries_without_context.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: &'static str,
}

impl Timer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Returns the elapsed duration in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Stops the timer, logs the duration and returns it in milliseconds.
    pub fn stop(self) -> f64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!(label = self.label, elapsed_ms = elapsed, "Timer stopped");
        elapsed
    }
}
