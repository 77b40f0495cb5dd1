//! Message-assembly latency accounting.
//!
//! Latency is the time from an aircraft's first message to the moment
//! all required track fields are populated. Aircraft that never get
//! there within the configured timeout are counted as incomplete.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Number of latency buckets.
pub const NUM_BUCKETS: usize = 8;

/// Bucket upper bounds in milliseconds: <100ms, <500ms, <1s, <5s,
/// <15s, <60s, <120s, and everything slower.
const BOUNDARIES: [f64; NUM_BUCKETS - 1] =
    [100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 60_000.0, 120_000.0];

/// Aggregate view of assembly behavior, computed on demand.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AssemblySnapshot {
    pub completed: u64,
    pub incomplete: u64,
    pub timeout_seconds: f64,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub buckets: [u64; NUM_BUCKETS],
}

/// Collector for per-aircraft assembly latencies.
pub struct AssemblyCollector {
    timeout_seconds: f64,
    samples_ms: Mutex<Vec<f64>>,
    buckets: [AtomicU64; NUM_BUCKETS],
    incomplete: AtomicU64,
}

impl AssemblyCollector {
    pub fn new(timeout_seconds: f64) -> Self {
        Self {
            timeout_seconds,
            samples_ms: Mutex::new(Vec::new()),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            incomplete: AtomicU64::new(0),
        }
    }

    /// Records one completed assembly.
    pub fn record_complete(&self, latency_ms: f64) {
        self.buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.samples_ms.lock().push(latency_ms);
    }

    /// Records one aircraft that hit the assembly timeout.
    pub fn record_incomplete(&self) {
        self.incomplete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incomplete_count(&self) -> u64 {
        self.incomplete.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.samples_ms.lock().len() as u64
    }

    /// Computes min/max/mean/median over everything recorded so far.
    pub fn snapshot(&self) -> AssemblySnapshot {
        let mut samples = self.samples_ms.lock().clone();
        samples.sort_by(|a, b| a.partial_cmp(b).expect("finite latencies"));

        let (min_ms, max_ms, mean_ms, median_ms) = if samples.is_empty() {
            (None, None, None, None)
        } else {
            let sum: f64 = samples.iter().sum();
            let mid = samples.len() / 2;
            let median = if samples.len() % 2 == 0 {
                (samples[mid - 1] + samples[mid]) / 2.0
            } else {
                samples[mid]
            };
            (
                Some(samples[0]),
                Some(samples[samples.len() - 1]),
                Some(sum / samples.len() as f64),
                Some(median),
            )
        };

        AssemblySnapshot {
            completed: samples.len() as u64,
            incomplete: self.incomplete.load(Ordering::Relaxed),
            timeout_seconds: self.timeout_seconds,
            min_ms,
            max_ms,
            mean_ms,
            median_ms,
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

fn bucket_index(latency_ms: f64) -> usize {
    for (i, &bound) in BOUNDARIES.iter().enumerate() {
        if latency_ms < bound {
            return i;
        }
    }
    NUM_BUCKETS - 1
}
