//! Side-by-side comparison of benchmark runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runner::{RunResult, RunState, StopReason};
use crate::stats::Summary;

/// Default allowed difference in sample counts, in percent.
pub const DEFAULT_TOLERANCE_PCT: f64 = 0.0;

/// Comparator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparatorConfig {
    /// Largest allowed spread between sample counts, as a percentage of the
    /// largest count.
    pub tolerance_pct: f64,
}

impl ComparatorConfig {
    /// Set the sample count tolerance.
    pub fn with_tolerance_pct(mut self, tolerance_pct: f64) -> Self {
        self.tolerance_pct = tolerance_pct;
        self
    }
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            tolerance_pct: DEFAULT_TOLERANCE_PCT,
        }
    }
}

/// Collects labelled run results and turns them into a [`ComparisonReport`].
#[derive(Debug, Default)]
pub struct Comparator {
    config: ComparatorConfig,
    results: Vec<(String, RunResult)>,
}

impl Comparator {
    /// Create an empty comparator.
    pub fn new(config: ComparatorConfig) -> Self {
        Self {
            config,
            results: Vec::new(),
        }
    }

    /// Add a result under `label`.
    ///
    /// Labels must be unique. Adding the same profile and operation twice
    /// under different labels is allowed but logged.
    pub fn add(&mut self, label: impl Into<String>, result: RunResult) -> Result<()> {
        let label = label.into();
        if self.results.iter().any(|(existing, _)| *existing == label) {
            return Err(Error::Comparison(format!("duplicate label '{}'", label)));
        }
        if let Some((existing, _)) = self.results.iter().find(|(_, other)| {
            other.profile() == result.profile()
                && other.operation() == result.operation()
                && other.concurrency() == result.concurrency()
        }) {
            tracing::warn!(
                label = %label,
                duplicate_of = %existing,
                target = %result.profile().target(),
                "same configuration benchmarked under two labels"
            );
        }
        self.results.push((label, result));
        Ok(())
    }

    /// Number of results collected.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Build the report, refusing when sample counts differ beyond tolerance.
    pub fn report(self) -> Result<ComparisonReport> {
        if self.results.is_empty() {
            return Err(Error::Comparison("nothing to compare".to_string()));
        }
        let tolerance = self.config.tolerance_pct;
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "tolerance must be a non-negative percentage, got {}",
                tolerance
            )));
        }

        let counts = self.results.iter().map(|(label, r)| (label, r.sample_count()));
        let (min_label, min) = counts
            .clone()
            .min_by_key(|(_, count)| *count)
            .map(|(label, count)| (label.clone(), count))
            .unwrap_or_default();
        let (max_label, max) = counts
            .max_by_key(|(_, count)| *count)
            .map(|(label, count)| (label.clone(), count))
            .unwrap_or_default();
        let spread = if max == 0 {
            0.0
        } else {
            (max - min) as f64 / max as f64 * 100.0
        };
        if spread > tolerance {
            return Err(Error::Comparison(format!(
                "sample counts differ by {:.2}% ('{}' has {}, '{}' has {}), tolerance is {:.2}%",
                spread, max_label, max, min_label, min, tolerance
            )));
        }

        let mut entries = Vec::with_capacity(self.results.len());
        let mut baseline_mean = None;
        for (label, result) in self.results {
            let summary = result.summary();
            let baseline = *baseline_mean.get_or_insert(summary.mean_ns);
            let relative_mean = if baseline > 0.0 {
                summary.mean_ns / baseline
            } else {
                0.0
            };
            entries.push(ReportEntry {
                label,
                driver: result.driver().to_string(),
                target: result.profile().to_string(),
                operation: result.operation().to_string(),
                concurrency: result.concurrency(),
                state: result.state(),
                stop_reason: result.stop_reason(),
                abort_reason: result.abort_reason().map(|e| e.to_string()),
                summary,
                relative_mean,
                result,
            });
        }

        Ok(ComparisonReport {
            generated_at: Utc::now(),
            tolerance_pct: tolerance,
            entries,
        })
    }
}

/// One labelled row of a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub label: String,
    pub driver: String,
    pub target: String,
    pub operation: String,
    pub concurrency: usize,
    pub state: RunState,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub summary: Summary,
    /// Mean latency relative to the first entry.
    pub relative_mean: f64,
    #[serde(skip)]
    result: RunResult,
}

impl ReportEntry {
    /// Underlying run result.
    pub fn result(&self) -> &RunResult {
        &self.result
    }
}

/// Labelled run results in insertion order.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub generated_at: DateTime<Utc>,
    pub tolerance_pct: f64,
    pub entries: Vec<ReportEntry>,
}

impl ComparisonReport {
    /// Look up an entry by label.
    pub fn get(&self, label: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|entry| entry.label == label)
    }

    /// Labels in insertion order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::operation::{OperationSpec, Sample};
    use crate::profile::ConnectionProfile;

    fn profile(port: u32) -> ConnectionProfile {
        ConnectionProfile::builder("localhost", port)
            .user("root")
            .build()
            .unwrap()
    }

    fn result(port: u32, samples: usize, us: u64) -> RunResult {
        let samples = (0..samples)
            .map(|_| Sample::success(Duration::from_micros(us)))
            .collect();
        RunResult::from_samples(
            profile(port),
            OperationSpec::scalar("select 1"),
            1,
            samples,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_refuses_unequal_counts() {
        let mut comparator = Comparator::default();
        comparator.add("a", result(3306, 1000, 100)).unwrap();
        comparator.add("b", result(3307, 500, 100)).unwrap();

        let err = comparator.report().unwrap_err();
        assert!(matches!(err, Error::Comparison(_)));
        assert!(err.to_string().contains("50.00%"));
    }

    #[test]
    fn test_tolerance_allows_small_spread() {
        let mut comparator = Comparator::new(ComparatorConfig::default().with_tolerance_pct(5.0));
        comparator.add("a", result(3306, 1000, 100)).unwrap();
        comparator.add("b", result(3307, 960, 100)).unwrap();
        assert_eq!(comparator.report().unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut comparator = Comparator::default();
        comparator.add("native", result(3306, 10, 100)).unwrap();
        let err = comparator.add("native", result(3307, 10, 100)).unwrap_err();
        assert!(matches!(err, Error::Comparison(_)));
        assert_eq!(comparator.len(), 1);
    }

    #[test]
    fn test_same_profile_under_two_labels_is_allowed() {
        let mut comparator = Comparator::default();
        comparator.add("first", result(3306, 10, 100)).unwrap();
        comparator.add("second", result(3306, 10, 100)).unwrap();
        assert_eq!(comparator.report().unwrap().len(), 2);
    }

    #[test]
    fn test_insertion_order_and_relative_mean() {
        let mut comparator = Comparator::default();
        comparator.add("zeta", result(3306, 10, 100)).unwrap();
        comparator.add("alpha", result(3307, 10, 200)).unwrap();

        let report = comparator.report().unwrap();
        assert_eq!(report.labels().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert!((report.entries[0].relative_mean - 1.0).abs() < 1e-9);
        assert!((report.entries[1].relative_mean - 2.0).abs() < 1e-9);
        assert_eq!(report.get("alpha").unwrap().summary.p50_ns, 200_000);
    }

    #[test]
    fn test_empty_comparator_fails() {
        assert!(matches!(
            Comparator::default().report(),
            Err(Error::Comparison(_))
        ));
    }

    #[test]
    fn test_report_serializes_without_samples() {
        let mut comparator = Comparator::default();
        comparator.add("only", result(3306, 3, 100)).unwrap();
        let json = serde_json::to_value(comparator.report().unwrap()).unwrap();

        let entry = &json["entries"][0];
        assert_eq!(entry["label"], "only");
        assert_eq!(entry["state"], "done");
        assert_eq!(entry["summary"]["samples"], 3);
        assert!(entry.get("result").is_none());
    }
}
