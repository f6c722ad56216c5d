//! Latency statistics for benchmark runs.
//!
//! Summaries are computed from the full, immutable sample sequence of a run,
//! so they can be recomputed at any time and always agree with the samples.
//! Percentiles use the nearest-rank method over successful samples; error
//! rate is taken over every sample.

use std::time::Duration;

use serde::Serialize;

use crate::operation::Sample;

/// Histogram bucket upper bounds in microseconds.
///
/// 100us, 500us, 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s
pub const LATENCY_BUCKETS_US: [u64; 10] = [
    100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000,
];

/// Number of samples falling into one latency bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    /// Upper bound in microseconds; `None` for the overflow bucket.
    pub le_us: Option<u64>,
    pub count: u64,
}

/// Aggregate statistics over one run's samples. Latencies are in nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub samples: u64,
    pub successes: u64,
    pub failures: u64,
    /// Failed samples over all samples, between 0 and 1.
    pub error_rate: f64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub std_dev_ns: f64,
    /// Completed operations per second over the timed window.
    pub throughput: f64,
    pub buckets: Vec<Bucket>,
}

impl Summary {
    /// Compute a summary from samples collected over `elapsed`.
    pub fn from_samples(samples: &[Sample], elapsed: Duration) -> Self {
        let mut latencies: Vec<u64> = samples
            .iter()
            .filter(|s| s.is_success())
            .map(|s| duration_ns(s.duration()))
            .collect();
        latencies.sort_unstable();

        let total = samples.len() as u64;
        let successes = latencies.len() as u64;
        let failures = total - successes;
        let error_rate = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        };
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 { total as f64 / secs } else { 0.0 };

        let (mean_ns, std_dev_ns) = mean_and_std_dev(&latencies);

        Self {
            samples: total,
            successes,
            failures,
            error_rate,
            min_ns: latencies.first().copied().unwrap_or(0),
            max_ns: latencies.last().copied().unwrap_or(0),
            mean_ns,
            p50_ns: percentile(&latencies, 0.50),
            p95_ns: percentile(&latencies, 0.95),
            p99_ns: percentile(&latencies, 0.99),
            std_dev_ns,
            throughput,
            buckets: bucketize(&latencies),
        }
    }

    /// Error rate as a percentage.
    pub fn error_rate_pct(&self) -> f64 {
        self.error_rate * 100.0
    }
}

/// Nearest-rank percentile of an ascending slice; 0 for an empty slice.
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn mean_and_std_dev(values: &[u64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let len = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / len;
    let variance = values
        .iter()
        .map(|&v| {
            let diff = v as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / len;
    (mean, variance.sqrt())
}

fn bucketize(sorted: &[u64]) -> Vec<Bucket> {
    let mut counts = [0u64; LATENCY_BUCKETS_US.len() + 1];
    for &ns in sorted {
        let us = ns / 1_000;
        let slot = LATENCY_BUCKETS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        counts[slot] += 1;
    }
    counts
        .iter()
        .enumerate()
        .map(|(i, &count)| Bucket {
            le_us: LATENCY_BUCKETS_US.get(i).copied(),
            count,
        })
        .collect()
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Format a latency in human units (ns/µs/ms/s).
pub fn format_latency(ns: u64) -> String {
    if ns < 1_000 {
        format!("{}ns", ns)
    } else if ns < 1_000_000 {
        format!("{:.2}µs", ns as f64 / 1_000.0)
    } else if ns < 1_000_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn ok(us: u64) -> Sample {
        Sample::success(Duration::from_micros(us))
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&values, 0.50), 50);
        assert_eq!(percentile(&values, 0.95), 95);
        assert_eq!(percentile(&values, 0.99), 99);
        assert_eq!(percentile(&values, 1.0), 100);
        assert_eq!(percentile(&[7], 0.99), 7);
        assert_eq!(percentile(&[], 0.5), 0);
    }

    #[test]
    fn test_percentiles_monotonic() {
        let samples: Vec<Sample> = [900, 15, 40, 3_000, 70, 70, 12, 55_000]
            .iter()
            .map(|&us| ok(us))
            .collect();
        let summary = Summary::from_samples(&samples, Duration::from_secs(1));

        assert!(summary.min_ns <= summary.p50_ns);
        assert!(summary.p50_ns <= summary.p95_ns);
        assert!(summary.p95_ns <= summary.p99_ns);
        assert!(summary.p99_ns <= summary.max_ns);
        assert_eq!(summary.max_ns, 55_000_000);
    }

    #[test]
    fn test_failures_count_toward_error_rate_only() {
        let mut samples: Vec<Sample> = (0..99).map(|_| ok(100)).collect();
        samples.push(Sample::failure(
            Duration::from_secs(30),
            &Error::Query("boom".into()),
        ));
        let summary = Summary::from_samples(&samples, Duration::from_secs(2));

        assert_eq!(summary.samples, 100);
        assert_eq!(summary.successes, 99);
        assert_eq!(summary.failures, 1);
        assert!((summary.error_rate_pct() - 1.0).abs() < 1e-9);
        // The slow failed sample does not skew latency
        assert_eq!(summary.max_ns, 100_000);
        assert!((summary.throughput - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_and_std_dev() {
        let samples = vec![ok(1), ok(2), ok(3), ok(4)];
        let summary = Summary::from_samples(&samples, Duration::from_secs(1));
        assert!((summary.mean_ns - 2_500.0).abs() < 1e-9);
        assert!((summary.std_dev_ns - 1_118.033_988_749_895).abs() < 1e-6);
    }

    #[test]
    fn test_buckets() {
        let samples = vec![ok(50), ok(200), ok(1_500), ok(10_000_000)];
        let summary = Summary::from_samples(&samples, Duration::from_secs(1));

        assert_eq!(summary.buckets.len(), LATENCY_BUCKETS_US.len() + 1);
        assert_eq!(summary.buckets[0], Bucket { le_us: Some(100), count: 1 });
        assert_eq!(summary.buckets[1], Bucket { le_us: Some(500), count: 1 });
        assert_eq!(summary.buckets[3].count, 1);
        assert_eq!(summary.buckets[10], Bucket { le_us: None, count: 1 });
    }

    #[test]
    fn test_empty() {
        let summary = Summary::from_samples(&[], Duration::ZERO);
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.p99_ns, 0);
        assert_eq!(summary.error_rate, 0.0);
        assert_eq!(summary.throughput, 0.0);
    }

    #[test]
    fn test_format_latency() {
        assert_eq!(format_latency(999), "999ns");
        assert_eq!(format_latency(1_500), "1.50µs");
        assert_eq!(format_latency(2_250_000), "2.25ms");
        assert_eq!(format_latency(3_000_000_000), "3.00s");
    }
}
