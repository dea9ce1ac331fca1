//! Tuning results and run statistics.

use schedforge_ir::{LoweredFunc, ScheduleDesc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Why a tuning run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RoundBudget,
    MeasureBudget,
    /// Too many consecutive rounds without a successful measurement.
    ContinuousEmpty,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::RoundBudget => "round budget exhausted",
            StopReason::MeasureBudget => "measurement budget exhausted",
            StopReason::ContinuousEmpty => "no successful candidate in consecutive rounds",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

/// Counters collected over one tuning run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningStats {
    pub rounds: usize,
    /// Candidates proposed by the search.
    pub candidates: usize,
    /// Candidates dropped because lowering rejected them.
    pub invalid: usize,
    pub measured: usize,
    pub successes: usize,
    /// Failed measurements keyed by failure kind.
    pub failures: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl TuningStats {
    pub fn record_failure(&mut self, kind: &str) {
        *self.failures.entry(kind.to_string()).or_default() += 1;
    }

    pub fn num_failures(&self) -> usize {
        self.failures.values().sum()
    }
}

/// The function selected for a task by a tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedComputeExpr {
    pub task: String,
    /// Task fingerprint, the database key.
    pub fingerprint: String,
    pub func: LoweredFunc,
    pub schedule: ScheduleDesc,
    /// Measured latency of `schedule`, absent when nothing was measured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_ms: Option<f64>,
    /// False when the run fell back to the unscheduled baseline.
    pub improved: bool,
    pub stats: TuningStats,
}

impl OptimizedComputeExpr {
    /// Save report to JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load report from JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let report = serde_json::from_str(&json)?;
        Ok(report)
    }
}

impl fmt::Display for OptimizedComputeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cost_ms {
            Some(cost) => write!(f, "{}: {:.4} ms", self.task, cost)?,
            None => write!(f, "{}: unmeasured", self.task)?,
        }
        if !self.improved {
            write!(f, " (baseline)")?;
        }
        write!(f, ", {} steps", self.schedule.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schedforge_ir::{ElementwiseOp, FuncBuilder};

    #[test]
    fn test_stop_reason_serialization() {
        let json = serde_json::to_string(&StopReason::ContinuousEmpty).unwrap();
        assert_eq!(json, "\"continuous_empty\"");
    }

    #[test]
    fn test_report_save_and_load() {
        let func = FuncBuilder::new("relu")
            .elementwise(ElementwiseOp::Relu, &[8])
            .unwrap();
        let mut stats = TuningStats::default();
        stats.record_failure("timeout");
        stats.record_failure("timeout");
        stats.stop_reason = Some(StopReason::RoundBudget);
        let report = OptimizedComputeExpr {
            task: "relu".into(),
            fingerprint: "abc".into(),
            func,
            schedule: ScheduleDesc::default(),
            cost_ms: Some(0.5),
            improved: true,
            stats,
        };

        let path = std::env::temp_dir().join(format!(
            "schedforge-report-{}.json",
            std::process::id()
        ));
        report.save(&path).unwrap();
        let loaded = OptimizedComputeExpr::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.func, report.func);
        assert_eq!(loaded.stats, report.stats);
        assert_eq!(loaded.stats.num_failures(), 2);
    }
}
