//! In-process metrics registry.
//!
//! Counters and gauges are lock-free atomics handed out once per
//! (name, labels) pair; histograms sit behind a cheap lock. The registry is
//! process-wide but owned by the [`crate::agent::Agent`] and passed by
//! reference — there are no hidden globals. Snapshots are exported to the
//! structured log on shutdown.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Histogram bucket upper bounds, in seconds. Tuned for external-call and
/// pipeline latencies (10 ms .. 5 min).
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

type MetricKey = (&'static str, BTreeMap<&'static str, String>);

fn key(name: &'static str, labels: &[(&'static str, &str)]) -> MetricKey {
    let labels = labels
        .iter()
        .map(|(k, v)| (*k, (*v).to_string()))
        .collect();
    (name, labels)
}

#[derive(Default, Debug)]
struct Histogram {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if self.bucket_counts.is_empty() {
            self.bucket_counts = vec![0; DURATION_BUCKETS.len() + 1];
        }
        let idx = DURATION_BUCKETS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(DURATION_BUCKETS.len());
        self.bucket_counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }
}

/// One exported sample, used for the shutdown snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: &'static str,
    pub labels: BTreeMap<&'static str, String>,
    pub value: f64,
}

#[derive(Default, Debug)]
pub struct MetricsRegistry {
    counters: Mutex<HashMap<MetricKey, Arc<AtomicU64>>>,
    gauges: Mutex<HashMap<MetricKey, Arc<AtomicI64>>>,
    histograms: Mutex<HashMap<MetricKey, Arc<Mutex<Histogram>>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter, creating it on first use.
    pub fn inc_counter(&self, name: &'static str, labels: &[(&'static str, &str)], by: u64) {
        let cell = {
            let mut counters = self.counters.lock().expect("metrics lock");
            Arc::clone(
                counters
                    .entry(key(name, labels))
                    .or_insert_with(|| Arc::new(AtomicU64::new(0))),
            )
        };
        cell.fetch_add(by, Ordering::Relaxed);
    }

    /// Read a counter without creating it. Missing counters read as zero.
    pub fn counter_value(&self, name: &'static str, labels: &[(&'static str, &str)]) -> u64 {
        let counters = self.counters.lock().expect("metrics lock");
        counters
            .get(&key(name, labels))
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: i64) {
        let cell = {
            let mut gauges = self.gauges.lock().expect("metrics lock");
            Arc::clone(
                gauges
                    .entry(key(name, labels))
                    .or_insert_with(|| Arc::new(AtomicI64::new(0))),
            )
        };
        cell.store(value, Ordering::Relaxed);
    }

    pub fn add_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], delta: i64) {
        let cell = {
            let mut gauges = self.gauges.lock().expect("metrics lock");
            Arc::clone(
                gauges
                    .entry(key(name, labels))
                    .or_insert_with(|| Arc::new(AtomicI64::new(0))),
            )
        };
        cell.fetch_add(delta, Ordering::Relaxed);
    }

    /// Record a latency observation in seconds.
    pub fn observe_duration(
        &self,
        name: &'static str,
        labels: &[(&'static str, &str)],
        duration: Duration,
    ) {
        let hist = {
            let mut histograms = self.histograms.lock().expect("metrics lock");
            Arc::clone(
                histograms
                    .entry(key(name, labels))
                    .or_insert_with(|| Arc::new(Mutex::new(Histogram::default()))),
            )
        };
        hist.lock().expect("metrics lock").observe(duration.as_secs_f64());
    }

    /// Flat snapshot of every counter and gauge, plus histogram sums and
    /// counts. Ordering is unspecified.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();
        for (key, cell) in self.counters.lock().expect("metrics lock").iter() {
            samples.push(MetricSample {
                name: key.0,
                labels: key.1.clone(),
                value: cell.load(Ordering::Relaxed) as f64,
            });
        }
        for (key, cell) in self.gauges.lock().expect("metrics lock").iter() {
            samples.push(MetricSample {
                name: key.0,
                labels: key.1.clone(),
                value: cell.load(Ordering::Relaxed) as f64,
            });
        }
        for (key, hist) in self.histograms.lock().expect("metrics lock").iter() {
            let hist = hist.lock().expect("metrics lock");
            samples.push(MetricSample {
                name: key.0,
                labels: key.1.clone(),
                value: hist.sum,
            });
            let mut count_labels = key.1.clone();
            count_labels.insert("stat", "count".to_string());
            samples.push(MetricSample {
                name: key.0,
                labels: count_labels,
                value: hist.count as f64,
            });
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate_per_label_set() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("messages_processed", &[("result", "no_traceback")], 1);
        registry.inc_counter("messages_processed", &[("result", "no_traceback")], 2);
        registry.inc_counter("messages_processed", &[("result", "error")], 1);

        assert_eq!(
            registry.counter_value("messages_processed", &[("result", "no_traceback")]),
            3
        );
        assert_eq!(
            registry.counter_value("messages_processed", &[("result", "error")]),
            1
        );
        assert_eq!(registry.counter_value("messages_processed", &[]), 0);
    }

    #[test]
    fn gauges_set_and_add() {
        let registry = MetricsRegistry::new();
        registry.set_gauge("active_workers", &[], 3);
        registry.add_gauge("active_workers", &[], -1);
        let samples = registry.snapshot();
        let sample = samples
            .iter()
            .find(|s| s.name == "active_workers")
            .expect("gauge sample");
        assert_eq!(sample.value, 2.0);
    }

    #[test]
    fn histogram_snapshot_exports_sum_and_count() {
        let registry = MetricsRegistry::new();
        registry.observe_duration("pipeline_seconds", &[], Duration::from_millis(200));
        registry.observe_duration("pipeline_seconds", &[], Duration::from_millis(800));

        let samples = registry.snapshot();
        let count = samples
            .iter()
            .find(|s| s.name == "pipeline_seconds" && s.labels.get("stat").is_some())
            .expect("count sample");
        assert_eq!(count.value, 2.0);
    }
}
