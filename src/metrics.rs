//! Phase timing for the translation pipeline. Each phase keeps a bounded
//! sliding window of recent durations plus lifetime counters; summaries
//! report count, mean, and nearest-rank percentiles over the window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Recent samples retained per phase; older ones age out.
const WINDOW_CAPACITY: usize = 512;

/// Names of the recorded pipeline phases.
pub mod metric_names {
    pub const MEMORY_LOOKUP: &str = "memory_lookup";
    pub const CHUNK_SPLIT: &str = "chunk_split";
    pub const API_CALL: &str = "api_call";
    pub const BATCH_TOTAL: &str = "batch_total";
}

/// Measures one phase from creation to explicit finish.
pub struct TimingSpan {
    name: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// End the span and record its duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.registry.record(self.name, elapsed);
        elapsed
    }
}

/// Per-phase state: the sample window and counters covering every sample
/// ever recorded, not just the ones still in the window.
#[derive(Default)]
struct PhaseStats {
    window: VecDeque<u64>,
    lifetime_count: u64,
    lifetime_sum_us: u64,
}

impl PhaseStats {
    fn record(&mut self, elapsed_us: u64) {
        if self.window.len() == WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back(elapsed_us);
        self.lifetime_count += 1;
        self.lifetime_sum_us = self.lifetime_sum_us.saturating_add(elapsed_us);
    }

    /// Nearest-rank percentile over the window, in microseconds.
    fn percentile(&self, p: f64) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    fn summary(&self) -> MetricSummary {
        let mean_us = if self.lifetime_count == 0 {
            0
        } else {
            self.lifetime_sum_us / self.lifetime_count
        };
        MetricSummary {
            count: self.lifetime_count,
            mean_us,
            p50_us: self.percentile(50.0),
            p95_us: self.percentile(95.0),
            p99_us: self.percentile(99.0),
        }
    }
}

/// Registry of all phase timings for one service instance.
pub struct MetricsRegistry {
    phases: Mutex<HashMap<&'static str, PhaseStats>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            phases: Mutex::new(HashMap::new()),
        }
    }

    /// Start a span that records into this registry on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Record one phase duration.
    pub fn record(&self, name: &'static str, elapsed: Duration) {
        self.phases
            .lock()
            .entry(name)
            .or_default()
            .record(elapsed.as_micros() as u64);
    }

    /// Percentile (0-100) for one phase, in microseconds; 0 if unrecorded.
    pub fn percentile(&self, name: &str, p: f64) -> u64 {
        self.phases
            .lock()
            .get(name)
            .map(|stats| stats.percentile(p))
            .unwrap_or(0)
    }

    /// Summaries for every phase recorded so far.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        self.phases
            .lock()
            .iter()
            .map(|(&name, stats)| (name.to_string(), stats.summary()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricSummary {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}
