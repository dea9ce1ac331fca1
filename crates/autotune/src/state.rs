//! Candidate points of the schedule space.

use crate::fingerprint::fingerprint;
use crate::task::TuneTask;
use schedforge_ir::{LoweredFunc, LoweringError, ScheduleDesc};

/// A prediction and the model version that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Prediction {
    cost: f64,
    model_version: u64,
}

/// A schedule together with the loop nest it produces.
///
/// Two states with equal fingerprints have the same loop nest and are
/// interchangeable.
#[derive(Debug, Clone)]
pub struct SearchState {
    schedule: ScheduleDesc,
    func: LoweredFunc,
    fingerprint: String,
    prediction: Option<Prediction>,
    measured_cost: Option<f64>,
    /// Discovery order; the earlier state wins ties.
    sequence: u64,
}

impl SearchState {
    pub fn new(schedule: ScheduleDesc, func: LoweredFunc, sequence: u64) -> Self {
        let fingerprint = fingerprint(&func.loops);
        Self {
            schedule,
            func,
            fingerprint,
            prediction: None,
            measured_cost: None,
            sequence,
        }
    }

    pub fn baseline(task: &TuneTask) -> Self {
        Self::new(ScheduleDesc::default(), task.baseline.clone(), 0)
    }

    /// Replay `schedule` on the task's baseline.
    pub fn from_schedule(
        task: &TuneTask,
        schedule: ScheduleDesc,
        sequence: u64,
    ) -> Result<Self, LoweringError> {
        let func = schedule.replay(&task.baseline)?;
        Ok(Self::new(schedule, func, sequence))
    }

    pub fn schedule(&self) -> &ScheduleDesc {
        &self.schedule
    }

    pub fn func(&self) -> &LoweredFunc {
        &self.func
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn predicted_cost(&self) -> Option<f64> {
        self.prediction.map(|prediction| prediction.cost)
    }

    /// The cached prediction, if it was made by `model_version`.
    pub fn cached_prediction(&self, model_version: u64) -> Option<f64> {
        self.prediction
            .filter(|prediction| prediction.model_version == model_version)
            .map(|prediction| prediction.cost)
    }

    pub fn set_prediction(&mut self, cost: f64, model_version: u64) {
        self.prediction = Some(Prediction {
            cost,
            model_version,
        });
    }

    pub fn clear_prediction(&mut self) {
        self.prediction = None;
    }

    /// Latency of the successful measurement, in milliseconds.
    pub fn measured_cost(&self) -> Option<f64> {
        self.measured_cost
    }

    pub fn set_measured_cost(&mut self, cost_ms: f64) {
        self.measured_cost = Some(cost_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schedforge_ir::{FuncBuilder, ScheduleStep, Target};

    #[test]
    fn equivalent_schedules_share_a_fingerprint() -> anyhow::Result<()> {
        let task = TuneTask::new("mm", FuncBuilder::new("mm").matmul(8, 8, 8)?, Target::cpu(2))?;
        let swap = |first: &str, second: &str| ScheduleStep::Reorder {
            first: first.into(),
            second: second.into(),
        };
        let twice = ScheduleDesc::new(vec![swap("i", "j"), swap("j", "i")]);
        let state = SearchState::from_schedule(&task, twice, 3)?;
        assert_eq!(state.fingerprint(), task.baseline_state().fingerprint());

        let once = SearchState::from_schedule(&task, ScheduleDesc::new(vec![swap("i", "j")]), 4)?;
        assert_ne!(once.fingerprint(), state.fingerprint());
        Ok(())
    }

    #[test]
    fn stale_predictions_are_ignored() -> anyhow::Result<()> {
        let task = TuneTask::new("mm", FuncBuilder::new("mm").matmul(8, 8, 8)?, Target::cpu(2))?;
        let mut state = task.baseline_state();
        state.set_prediction(2.5, 1);
        assert_eq!(state.cached_prediction(1), Some(2.5));
        assert_eq!(state.cached_prediction(2), None);
        state.clear_prediction();
        assert_eq!(state.predicted_cost(), None);
        Ok(())
    }

    #[test]
    fn measurement_survives_prediction_updates() -> anyhow::Result<()> {
        let task = TuneTask::new("mm", FuncBuilder::new("mm").matmul(8, 8, 8)?, Target::cpu(2))?;
        let mut state = task.baseline_state();
        assert_eq!(state.measured_cost(), None);
        state.set_measured_cost(1.25);
        state.set_prediction(9.0, 4);
        state.clear_prediction();
        assert_eq!(state.measured_cost(), Some(1.25));
        assert_eq!(state.clone().measured_cost(), Some(1.25));
        Ok(())
    }
}
