//! Per-method attempt counters and latency statistics.

use crate::detection::LocatorMethod;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
struct MethodStats {
    attempts: u64,
    successes: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl MethodStats {
    fn record(&mut self, success: bool, latency: Duration) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
        self.total += latency;
        self.min = Some(self.min.map_or(latency, |m| m.min(latency)));
        self.max = self.max.max(latency);
    }

    fn summary(&self) -> MethodSummary {
        let to_ms = |d: Duration| d.as_secs_f64() * 1000.0;
        if self.attempts == 0 {
            return MethodSummary::default();
        }
        MethodSummary {
            attempts: self.attempts,
            successes: self.successes,
            success_rate: self.successes as f64 / self.attempts as f64,
            avg_latency_ms: to_ms(self.total) / self.attempts as f64,
            min_latency_ms: self.min.map_or(0.0, to_ms),
            max_latency_ms: to_ms(self.max),
        }
    }
}

/// Statistics for one locator method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MethodSummary {
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
}

/// Point-in-time copy of all method statistics, keyed by method name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub methods: BTreeMap<LocatorMethod, MethodSummary>,
}

impl PerformanceReport {
    pub fn total_attempts(&self) -> u64 {
        self.methods.values().map(|m| m.attempts).sum()
    }
}

/// Written by the element locator after every attempt; everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    stats: Mutex<BTreeMap<LocatorMethod, MethodStats>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: LocatorMethod, success: bool, latency: Duration) {
        self.lock()
            .entry(method)
            .or_default()
            .record(success, latency);
    }

    pub fn snapshot(&self) -> PerformanceReport {
        let stats = self.lock();
        PerformanceReport {
            methods: stats.iter().map(|(m, s)| (*m, s.summary())).collect(),
        }
    }

    pub fn method(&self, method: LocatorMethod) -> MethodSummary {
        self.lock()
            .get(&method)
            .map(MethodStats::summary)
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<LocatorMethod, MethodStats>> {
        // Counters stay meaningful even if a recorder panicked mid-update.
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_per_method() {
        let tracker = PerformanceTracker::new();
        tracker.record(LocatorMethod::Text, false, Duration::from_millis(40));
        tracker.record(LocatorMethod::Text, true, Duration::from_millis(20));
        tracker.record(LocatorMethod::Coordinate, true, Duration::from_millis(1));

        let text = tracker.method(LocatorMethod::Text);
        assert_eq!(text.attempts, 2);
        assert_eq!(text.successes, 1);
        assert!((text.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((text.avg_latency_ms - 30.0).abs() < 1e-9);
        assert!((text.min_latency_ms - 20.0).abs() < 1e-9);
        assert!((text.max_latency_ms - 40.0).abs() < 1e-9);

        let report = tracker.snapshot();
        assert_eq!(report.total_attempts(), 3);
        assert!(!report.methods.contains_key(&LocatorMethod::Template));
    }

    #[test]
    fn unknown_method_reads_as_zero_and_reset_clears() {
        let tracker = PerformanceTracker::new();
        assert_eq!(tracker.method(LocatorMethod::Template), MethodSummary::default());
        tracker.record(LocatorMethod::Template, true, Duration::from_millis(5));
        tracker.reset();
        assert_eq!(tracker.snapshot().total_attempts(), 0);
    }

    #[test]
    fn report_serializes_with_method_names() {
        let tracker = PerformanceTracker::new();
        tracker.record(LocatorMethod::Template, true, Duration::from_millis(5));
        let json = serde_json::to_value(tracker.snapshot()).unwrap();
        assert_eq!(json["methods"]["template"]["attempts"], 1);
    }
}
