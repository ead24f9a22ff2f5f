use extract::ResolutionReport;
use index::WriteReport;
use serde::Serialize;
use sparsify::SparsityReport;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cache::CacheStats;

/// Counters accumulated across every build served by this process.
#[derive(Default)]
pub struct BuildMetrics {
    builds_started: AtomicUsize,
    builds_completed: AtomicUsize,
    builds_failed: AtomicUsize,

    // Timing (in microseconds)
    total_build_time_us: AtomicU64,

    documents_processed: AtomicUsize,
    chunks_processed: AtomicUsize,
    extraction_errors: AtomicUsize,
    documents_written: AtomicUsize,
}

impl BuildMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.builds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.builds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self, stats: &BuildStats, duration: Duration) {
        self.builds_completed.fetch_add(1, Ordering::Relaxed);
        self.total_build_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.documents_processed.fetch_add(stats.documents, Ordering::Relaxed);
        self.chunks_processed.fetch_add(stats.chunks, Ordering::Relaxed);
        self.extraction_errors.fetch_add(stats.extraction_errors, Ordering::Relaxed);
        self.documents_written.fetch_add(stats.write.documents_written, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.builds_completed.load(Ordering::Relaxed);
        let total_us = self.total_build_time_us.load(Ordering::Relaxed) as f64;
        MetricsSnapshot {
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_completed: completed,
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            avg_build_time_ms: if completed > 0 { total_us / completed as f64 / 1000.0 } else { 0.0 },
            documents_processed: self.documents_processed.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            extraction_errors: self.extraction_errors.load(Ordering::Relaxed),
            documents_written: self.documents_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub builds_started: usize,
    pub builds_completed: usize,
    pub builds_failed: usize,
    pub avg_build_time_ms: f64,
    pub documents_processed: usize,
    pub chunks_processed: usize,
    pub extraction_errors: usize,
    pub documents_written: usize,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub millis: f64,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildStats {
    pub run_id: Uuid,
    pub documents: usize,
    pub chunks: usize,
    /// Documents whose chunk structure could not be written; their chunks carry no id.
    pub structure_failures: usize,
    pub extraction_errors: usize,
    pub parse_failures: usize,
    pub resolution: ResolutionReport,
    pub sparsity: SparsityReport,
    pub write: WriteReport,
    pub cache: CacheStats,
    pub timings: Vec<StageTiming>,
    pub total_ms: f64,
}

impl BuildStats {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            documents: 0,
            chunks: 0,
            structure_failures: 0,
            extraction_errors: 0,
            parse_failures: 0,
            resolution: ResolutionReport::default(),
            sparsity: SparsityReport::default(),
            write: WriteReport::default(),
            cache: CacheStats::default(),
            timings: Vec::new(),
            total_ms: 0.0,
        }
    }

    pub fn record_stage(&mut self, stage: &'static str, timer: TimedOperation) {
        self.timings.push(StageTiming {
            stage,
            millis: timer.elapsed().as_secs_f64() * 1000.0,
        });
    }

    /// Merge one document's resolution report into the run total.
    pub fn add_resolution(&mut self, report: &ResolutionReport) {
        self.resolution.entities += report.entities;
        self.resolution.candidate_pairs += report.candidate_pairs;
        self.resolution.batches_submitted += report.batches_submitted;
        self.resolution.batches_discarded += report.batches_discarded;
        self.resolution.merges += report.merges;
    }
}
