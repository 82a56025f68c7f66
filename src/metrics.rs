//! Detection-path instrumentation: per-stage latency windows and cycle
//! counters. Latencies are kept in microseconds.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Measures one stage from creation until [`finish`](Self::finish).
pub struct TimingSpan {
    stage: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(stage: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            stage,
            started: Instant::now(),
            registry,
        }
    }

    /// Record the elapsed time and return it in microseconds.
    pub fn finish(self) -> f64 {
        let us = self.started.elapsed().as_secs_f64() * 1e6;
        self.registry.record(self.stage, us);
        us
    }
}

/// The most recent `capacity` latencies of one stage.
struct LatencyWindow {
    recent: VecDeque<f64>,
    capacity: usize,
    total: u64,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    fn push(&mut self, us: f64) {
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(us);
        self.total += 1;
    }

    fn sorted(&self) -> Vec<f64> {
        let mut v: Vec<f64> = self.recent.iter().copied().collect();
        v.sort_by(f64::total_cmp);
        v
    }

    fn summarize(&self) -> StageSummary {
        let sorted = self.sorted();
        let mean = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        StageSummary {
            samples: self.total,
            mean_us: mean,
            p50_us: rank(&sorted, 50.0),
            p95_us: rank(&sorted, 95.0),
            max_us: sorted.last().copied().unwrap_or(0.0),
        }
    }
}

/// Nearest-rank percentile of an ascending slice; 0 when empty.
fn rank(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n => {
            let idx = ((p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64).round() as usize;
            sorted[idx]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    /// Samples recorded since start, including ones aged out of the window.
    pub samples: u64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub max_us: f64,
}

/// Point-in-time view of every stage and counter, ordered by name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<&'static str, StageSummary>,
    pub counters: BTreeMap<&'static str, u64>,
}

pub struct MetricsRegistry {
    stages: Mutex<HashMap<&'static str, LatencyWindow>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    window: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(512)
    }

    /// Keep the last `window` latencies per stage.
    pub fn with_window(window: usize) -> Self {
        Self {
            stages: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    pub fn record(&self, stage: &'static str, us: f64) {
        self.stages
            .lock()
            .entry(stage)
            .or_insert_with(|| LatencyWindow::new(self.window))
            .push(us);
    }

    pub fn span(self: &Arc<Self>, stage: &'static str) -> TimingSpan {
        TimingSpan::new(stage, Arc::clone(self))
    }

    pub fn incr(&self, counter: &'static str) {
        *self.counters.lock().entry(counter).or_default() += 1;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.lock().get(counter).copied().unwrap_or(0)
    }

    pub fn stage(&self, stage: &str) -> Option<StageSummary> {
        self.stages.lock().get(stage).map(LatencyWindow::summarize)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = self
            .stages
            .lock()
            .iter()
            .map(|(&name, w)| (name, w.summarize()))
            .collect();
        let counters = self.counters.lock().iter().map(|(&k, &v)| (k, v)).collect();
        MetricsSnapshot { stages, counters }
    }
}

pub mod metric_names {
    // stages
    pub const EXTRACT: &str = "extract";
    pub const MATCH: &str = "match";
    pub const CYCLE: &str = "cycle";
    pub const DISPATCH_WAIT: &str = "dispatch_wait";
    // counters
    pub const CYCLES_EVALUATED: &str = "cycles_evaluated";
    pub const CYCLES_SKIPPED: &str = "cycles_skipped";
    pub const CYCLES_ABANDONED: &str = "cycles_abandoned";
    pub const TRIGGERS_FIRED: &str = "triggers_fired";
    pub const DISPATCH_FAILURES: &str = "dispatch_failures";
    pub const MATCH_PANICS: &str = "match_panics";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_recent_latencies() {
        let reg = MetricsRegistry::with_window(4);
        for us in [10.0, 20.0, 30.0, 40.0, 50.0] {
            reg.record(metric_names::MATCH, us);
        }
        let s = reg.stage(metric_names::MATCH).unwrap();
        assert_eq!(s.samples, 5);
        assert_eq!(s.mean_us, 35.0);
        assert_eq!(s.p50_us, 40.0);
        assert_eq!(s.max_us, 50.0);
        assert!(reg.stage(metric_names::EXTRACT).is_none());
    }

    #[test]
    fn rank_of_empty_and_single() {
        assert_eq!(rank(&[], 95.0), 0.0);
        assert_eq!(rank(&[7.0], 0.0), 7.0);
        assert_eq!(rank(&[1.0, 2.0, 3.0], 100.0), 3.0);
    }

    #[test]
    fn snapshot_lists_counters_and_spans() {
        let reg = Arc::new(MetricsRegistry::new());
        reg.incr(metric_names::CYCLES_SKIPPED);
        reg.incr(metric_names::CYCLES_SKIPPED);
        reg.span(metric_names::CYCLE).finish();

        let snap = reg.snapshot();
        assert_eq!(snap.counters[metric_names::CYCLES_SKIPPED], 2);
        assert_eq!(snap.stages[metric_names::CYCLE].samples, 1);
        assert_eq!(reg.counter(metric_names::TRIGGERS_FIRED), 0);
    }
}
