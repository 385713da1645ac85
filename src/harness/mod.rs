//! A multi-process interoperability harness. One process plays the reader
//! and serves a control socket; the other plays the holder and dials in.
//! Each iteration runs a full presentment over a dedicated TCP data
//! connection and both sides report wall-clock timings.
pub mod control;
pub mod runner;

use serde::{Deserialize, Serialize};

use crate::transport::TerminationStyle;

/// One batch of iterations sharing a termination style.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub termination: TerminationStyle,
    pub iterations: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    pub entries: Vec<PlanEntry>,
}

impl TestPlan {
    /// One iteration of each termination style.
    pub fn all_styles() -> Self {
        TestPlan {
            entries: [
                TerminationStyle::InBandStatus,
                TerminationStyle::CloseMessage,
                TerminationStyle::TransportSpecific,
            ]
            .into_iter()
            .map(|termination| PlanEntry {
                termination,
                iterations: 1,
            })
            .collect::<Vec<_>>()
            .into(),
        }
    }

    pub fn total_iterations(&self) -> u32 {
        self.entries.iter().map(|e| e.iterations).sum()
    }
}

impl From<Vec<PlanEntry>> for TestPlan {
    fn from(entries: Vec<PlanEntry>) -> Self {
        TestPlan { entries }
    }
}

/// What one side measured for a single iteration. Times are in
/// milliseconds; the holder reports its own processing time in the same
/// shape with scanning left at zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub index: u32,
    pub success: bool,
    /// Engagement received until the transport reported connected.
    pub scanning_ms: f64,
    /// Transport connected until the response was accepted.
    pub transaction_ms: f64,
}

impl IterationReport {
    pub fn failed(index: u32) -> Self {
        IterationReport {
            index,
            success: false,
            scanning_ms: 0.0,
            transaction_ms: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl TimingStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return TimingStats::default();
        }
        let count = samples.len();
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = samples.iter().sum::<f64>() / count as f64;
        let variance = samples
            .iter()
            .map(|s| (s - mean).powi(2))
            .sum::<f64>()
            / count as f64;
        TimingStats {
            count,
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
        }
    }
}

/// Aggregated outcome for one plan entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryResult {
    pub successes: u32,
    pub failures: u32,
    pub scanning: TimingStats,
    pub transaction: TimingStats,
    /// The holder's view of the same iterations, when it reported one.
    pub holder_transaction: TimingStats,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub entries: Vec<(TerminationStyle, EntryResult)>,
}

impl TestResult {
    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(|(_, e)| e.failures == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_known_samples() {
        let stats = TimingStats::from_samples(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(stats.count, 8);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.mean, 5.0);
        assert!((stats.std_dev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn stats_over_no_samples() {
        assert_eq!(TimingStats::from_samples(&[]), TimingStats::default());
    }

    #[test]
    fn default_plan_covers_every_style() {
        let plan = TestPlan::all_styles();
        assert_eq!(plan.total_iterations(), 3);
    }
}
