//! Latency telemetry and store-wide counters.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::Tier;

/// Mean/min/max/total/count derived from a bounded window of recall
/// latency samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
    pub count: u64,
}

/// Bounded ring of recall latency samples backing [`LatencyStats`].
///
/// Oldest samples are dropped once `capacity` is reached, matching the
/// original implementation's fixed-size recall-latency list.
pub struct LatencyTracker {
    samples: Vec<f64>,
    capacity: usize,
    cursor: usize,
    total_count: u64,
}

impl LatencyTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            cursor: 0,
            total_count: 0,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if self.samples.len() < self.capacity {
            self.samples.push(ms);
        } else {
            self.samples[self.cursor] = ms;
            self.cursor = (self.cursor + 1) % self.capacity;
        }
        self.total_count += 1;
    }

    #[must_use]
    pub fn stats(&self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::default();
        }
        let total: f64 = self.samples.iter().sum();
        let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        LatencyStats {
            mean_ms: total / self.samples.len() as f64,
            min_ms: min,
            max_ms: max,
            total_ms: total,
            count: self.total_count,
        }
    }
}

/// Store-wide counters returned by `MemoryHub::stats`.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub per_tier_counts: BTreeMap<Tier, u64>,
    pub total_stored: u64,
    pub total_recalled: u64,
    pub recall_latency: LatencyStats,
}
