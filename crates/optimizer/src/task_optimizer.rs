//! The per-task tuning loop.
//!
//! ```text
//! Idle ─▶ Searching ─▶ Measuring ─▶ Updating ─┐
//!              ▲                              │
//!              └──────────────────────────────┤
//!                                             ▼
//!                                   Terminated(best | baseline)
//! ```

use crate::options::TuningOptions;
use crate::report::{OptimizedComputeExpr, StopReason, TuningStats};
use crate::search::{EvolutionarySearch, SearchError};
use schedforge_autotune::{
    CostModel, Database, MeasureInput, MeasureResult, ScheduleMeasurer, SearchState,
    SharedCostModel, TuneTask,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tracing::{debug, info};

/// Cooperative stop request, checked between rounds.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerPhase {
    Idle,
    Searching,
    Measuring,
    Updating,
    Terminated { reason: StopReason, improved: bool },
}

/// Tunes one task against a shared measurer and database.
pub struct TaskOptimizer {
    task: Arc<TuneTask>,
    measurer: Arc<ScheduleMeasurer>,
    database: Arc<Database>,
    cost_model: SharedCostModel,
    search: Option<EvolutionarySearch>,
    cancel: CancellationToken,
    phase: TunerPhase,
}

impl TaskOptimizer {
    /// An optimizer with a private, untrained cost model.
    pub fn new(
        task: Arc<TuneTask>,
        measurer: Arc<ScheduleMeasurer>,
        database: Arc<Database>,
    ) -> Self {
        Self {
            task,
            measurer,
            database,
            cost_model: CostModel::default().shared(),
            search: None,
            cancel: CancellationToken::new(),
            phase: TunerPhase::Idle,
        }
    }

    /// Train and query a model shared with other optimizers.
    pub fn with_shared_cost_model(mut self, cost_model: SharedCostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn task(&self) -> &Arc<TuneTask> {
        &self.task
    }

    pub fn phase(&self) -> TunerPhase {
        self.phase
    }

    pub fn cost_model(&self) -> &SharedCostModel {
        &self.cost_model
    }

    /// Run the tuning loop and return the best measured function, or the
    /// baseline when nothing succeeded.
    pub fn optimize(&mut self, options: &TuningOptions) -> Result<OptimizedComputeExpr, SearchError> {
        options.validate().map_err(SearchError::InvalidOptions)?;
        self.optimize_by_evolution(options)
    }

    fn optimize_by_evolution(
        &mut self,
        options: &TuningOptions,
    ) -> Result<OptimizedComputeExpr, SearchError> {
        let mut stats = TuningStats::default();
        let mut best: Option<(SearchState, f64)> = None;
        let mut continuous_empty = 0usize;

        let reason = loop {
            if let Some(reason) = self.stop_reason(options, &stats, continuous_empty) {
                break reason;
            }

            self.phase = TunerPhase::Searching;
            let (candidates, inputs) = {
                let task = &self.task;
                let lowerer = self.measurer.lowerer();
                let search = self.search.get_or_insert_with(|| {
                    EvolutionarySearch::new(Arc::clone(task), options.seed)
                        .with_lowerer(Arc::clone(lowerer))
                });
                let model = self.cost_model.read().unwrap_or_else(PoisonError::into_inner);
                search.search_one_round(options, &model, &self.database)?
            };
            stats.rounds += 1;
            stats.candidates += candidates.len();

            let mut valid = self.prune_invalid(candidates, inputs, &mut stats);
            valid.truncate(options.num_measure_trials.saturating_sub(stats.measured));

            self.phase = TunerPhase::Measuring;
            let (states, inputs): (Vec<SearchState>, Vec<MeasureInput>) = valid.into_iter().unzip();
            let results = self.measurer.measure(&inputs);
            stats.measured += results.len();

            self.phase = TunerPhase::Updating;
            let mut successes = Vec::new();
            for (mut state, result) in states.into_iter().zip(results) {
                match result {
                    MeasureResult::Success { latency_ms } => {
                        state.set_measured_cost(latency_ms);
                        successes.push((state, latency_ms));
                    }
                    MeasureResult::Failure(err) => stats.record_failure(err.kind()),
                }
            }
            stats.successes += successes.len();

            if successes.is_empty() {
                continuous_empty += 1;
            } else {
                continuous_empty = 0;
                // stable: equal costs keep discovery order
                successes.sort_by(|a, b| a.1.total_cmp(&b.1));
                self.apply_round(&successes)?;
                if let Some((state, cost)) = successes.first() {
                    if best.as_ref().map_or(true, |(_, best_cost)| cost < best_cost) {
                        best = Some((state.clone(), *cost));
                    }
                }
            }

            info!(
                task = %self.task.name,
                round = stats.rounds,
                measured = stats.measured,
                successes = stats.successes,
                invalid = stats.invalid,
                best_ms = ?best.as_ref().map(|(_, cost)| *cost),
                "tuning round finished"
            );
        };

        stats.stop_reason = Some(reason);
        let improved = best.is_some();
        self.phase = TunerPhase::Terminated { reason, improved };

        let result = match best {
            Some((state, cost)) => OptimizedComputeExpr {
                task: self.task.name.clone(),
                fingerprint: self.task.fingerprint().to_string(),
                func: state.func().clone(),
                schedule: state.schedule().clone(),
                cost_ms: Some(cost),
                improved: true,
                stats,
            },
            None => OptimizedComputeExpr {
                task: self.task.name.clone(),
                fingerprint: self.task.fingerprint().to_string(),
                func: self.task.baseline.clone(),
                schedule: Default::default(),
                cost_ms: None,
                improved: false,
                stats,
            },
        };
        info!(
            task = %self.task.name,
            reason = %reason,
            improved,
            cost_ms = ?result.cost_ms,
            rounds = result.stats.rounds,
            "tuning finished"
        );
        Ok(result)
    }

    fn stop_reason(
        &self,
        options: &TuningOptions,
        stats: &TuningStats,
        continuous_empty: usize,
    ) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if stats.rounds >= options.max_rounds {
            Some(StopReason::RoundBudget)
        } else if stats.measured >= options.num_measure_trials {
            Some(StopReason::MeasureBudget)
        } else if continuous_empty >= options.max_retry_continuous_empty {
            Some(StopReason::ContinuousEmpty)
        } else {
            None
        }
    }

    /// Drop candidates the lowering collaborator rejects for the target.
    fn prune_invalid(
        &self,
        candidates: Vec<SearchState>,
        inputs: Vec<MeasureInput>,
        stats: &mut TuningStats,
    ) -> Vec<(SearchState, MeasureInput)> {
        let lowerer = self.measurer.lowerer();
        let mut valid = Vec::with_capacity(candidates.len());
        for (state, input) in candidates.into_iter().zip(inputs) {
            match lowerer.lower(&self.task.baseline, state.schedule(), &self.task.target) {
                Ok(_) => valid.push((state, input)),
                Err(err) => {
                    stats.invalid += 1;
                    debug!(
                        state = state.fingerprint(),
                        error = %err,
                        "pruned invalid candidate"
                    );
                }
            }
        }
        valid
    }

    /// Feed a round's successes, cheapest first, to the model and the database.
    fn apply_round(&self, successes: &[(SearchState, f64)]) -> Result<(), SearchError> {
        let batch: Vec<(&SearchState, f64)> =
            successes.iter().map(|(state, cost)| (state, *cost)).collect();
        self.cost_model
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .update(&self.task, &batch)?;
        for (state, cost) in successes {
            self.database
                .insert(self.task.fingerprint(), state.schedule(), *cost);
        }
        Ok(())
    }
}
