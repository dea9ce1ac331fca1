//! Evolutionary search over schedules.
//!
//! Each round seeds a population from the database, the baseline and random
//! walks, evolves it for a few generations with cost-model fitness, and
//! emits the best not-yet-measured states as measurement candidates.
//! Walks and offspring the target cannot lower never enter the population.

use crate::mutator::ScheduleMutator;
use crate::options::TuningOptions;
use fastrand::Rng;
use schedforge_autotune::{
    CostModel, Database, FeatureExtractionError, MeasureInput, SearchState, TuneTask,
};
use schedforge_ir::{Lowerer, ScheduleLowerer};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid tuning options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    FeatureExtraction(#[from] FeatureExtractionError),
}

/// Lower predicted cost first, then earlier discovery.
fn rank(a: &SearchState, b: &SearchState) -> Ordering {
    let cost = |state: &SearchState| state.predicted_cost().unwrap_or(f64::INFINITY);
    cost(a)
        .total_cmp(&cost(b))
        .then_with(|| a.sequence().cmp(&b.sequence()))
}

pub struct EvolutionarySearch {
    task: Arc<TuneTask>,
    mutator: ScheduleMutator,
    lowerer: Arc<dyn Lowerer>,
    rng: Rng,
    next_sequence: u64,
    /// Fingerprints already emitted in this session.
    emitted: HashSet<String>,
}

impl EvolutionarySearch {
    pub fn new(task: Arc<TuneTask>, seed: u64) -> Self {
        let mutator = ScheduleMutator::for_target(&task.target);
        Self {
            task,
            mutator,
            lowerer: Arc::new(ScheduleLowerer::new()),
            rng: Rng::with_seed(seed),
            // 0 belongs to the baseline
            next_sequence: 1,
            emitted: HashSet::new(),
        }
    }

    /// Legality check applied to walks and offspring; use the measurer's lowerer.
    pub fn with_lowerer(mut self, lowerer: Arc<dyn Lowerer>) -> Self {
        self.lowerer = lowerer;
        self
    }

    pub fn task(&self) -> &Arc<TuneTask> {
        &self.task
    }

    pub fn num_emitted(&self) -> usize {
        self.emitted.len()
    }

    fn lowers(&self, state: &SearchState) -> bool {
        self.lowerer
            .lower(&self.task.baseline, state.schedule(), &self.task.target)
            .is_ok()
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Propose up to `candidates_per_round` distinct, unmeasured states.
    pub fn search_one_round(
        &mut self,
        options: &TuningOptions,
        model: &CostModel,
        database: &Database,
    ) -> Result<(Vec<SearchState>, Vec<MeasureInput>), SearchError> {
        let mut population = self.seed_population(options, database);
        self.evaluate(&mut population, model)?;
        population.sort_by(rank);
        let population = self.evolve(population, options, model)?;
        let candidates = self.emit(&population, options);
        let inputs = candidates
            .iter()
            .map(|state| MeasureInput::new(Arc::clone(&self.task), state.clone()))
            .collect();
        debug!(
            task = %self.task.name,
            population = population.len(),
            candidates = candidates.len(),
            best_predicted = ?population.first().and_then(|state| state.predicted_cost()),
            "search round finished"
        );
        Ok((candidates, inputs))
    }

    fn seed_population(&mut self, options: &TuningOptions, database: &Database) -> Vec<SearchState> {
        let size = options.population_size;
        let max_seeded = (size as f64 * options.seed_ratio).round() as usize;
        let mut population = Vec::with_capacity(size);
        let mut seen = HashSet::new();

        for record in database
            .lookup(self.task.fingerprint())
            .into_iter()
            .take(max_seeded.min(size))
        {
            let sequence = self.next_sequence();
            match SearchState::from_schedule(&self.task, record.schedule, sequence) {
                Ok(state) => {
                    if seen.insert(state.fingerprint().to_string()) {
                        population.push(state);
                    }
                }
                Err(err) => debug!(error = %err, "database schedule no longer replays"),
            }
        }
        let seeded = population.len();

        let baseline = self.task.baseline_state();
        if population.len() < size && seen.insert(baseline.fingerprint().to_string()) {
            population.push(baseline);
        }

        let mut attempts = 0;
        let mut rejected = 0;
        while population.len() < size && attempts < size * 4 {
            attempts += 1;
            let depth = 1 + self.rng.usize(..options.init_walk_depth.max(1));
            let sequence = self.next_sequence();
            let Some(state) = self
                .mutator
                .random_walk(&self.task, depth, &mut self.rng, sequence)
            else {
                // the baseline has no legal mutation at all
                break;
            };
            if !seen.insert(state.fingerprint().to_string()) {
                continue;
            }
            if self.lowers(&state) {
                population.push(state);
            } else {
                rejected += 1;
            }
        }
        debug!(seeded, rejected, population = population.len(), "seeded population");
        population
    }

    /// Predict every state whose prediction is missing or stale.
    fn evaluate(
        &self,
        population: &mut [SearchState],
        model: &CostModel,
    ) -> Result<(), FeatureExtractionError> {
        let version = model.version();
        let pending: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(_, state)| state.cached_prediction(version).is_none())
            .map(|(index, _)| index)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let costs = {
            let states: Vec<&SearchState> = pending.iter().map(|&index| &population[index]).collect();
            model.predict_batch(&self.task, &states)?
        };
        for (&index, cost) in pending.iter().zip(costs) {
            population[index].set_prediction(cost, version);
        }
        Ok(())
    }

    fn tournament(&mut self, population: &[SearchState], size: usize) -> usize {
        let mut best = self.rng.usize(..population.len());
        for _ in 1..size {
            let challenger = self.rng.usize(..population.len());
            if rank(&population[challenger], &population[best]) == Ordering::Less {
                best = challenger;
            }
        }
        best
    }

    fn evolve(
        &mut self,
        mut population: Vec<SearchState>,
        options: &TuningOptions,
        model: &CostModel,
    ) -> Result<Vec<SearchState>, SearchError> {
        for generation in 0..options.generations {
            if population.is_empty() {
                break;
            }
            let mut seen: HashSet<String> = population
                .iter()
                .map(|state| state.fingerprint().to_string())
                .collect();
            let mut offspring = Vec::new();
            let mut rejected = 0;
            for _ in 0..options.population_size * 2 {
                if offspring.len() >= options.population_size {
                    break;
                }
                let parent = self.tournament(&population, options.tournament_size);
                let sequence = self.next_sequence();
                let child = if population.len() > 1 && self.rng.f64() < options.crossover_prob {
                    let other = self.tournament(&population, options.tournament_size);
                    self.mutator.crossover(
                        &self.task,
                        &population[parent],
                        &population[other],
                        &mut self.rng,
                        sequence,
                    )
                } else {
                    self.mutator
                        .mutate(&population[parent], &mut self.rng, sequence)
                };
                // a parent without a legal offspring stays in the population as is
                let Some(child) = child else {
                    continue;
                };
                if !seen.insert(child.fingerprint().to_string()) {
                    continue;
                }
                if self.lowers(&child) {
                    offspring.push(child);
                } else {
                    rejected += 1;
                }
            }

            self.evaluate(&mut offspring, model)?;
            let produced = offspring.len();
            population.extend(offspring);
            population.sort_by(rank);
            population.truncate(options.population_size);
            debug!(generation, offspring = produced, rejected, "evolved generation");
        }
        Ok(population)
    }

    /// Greedy picks by rank plus an `eps_greedy` share of random picks.
    fn emit(&mut self, population: &[SearchState], options: &TuningOptions) -> Vec<SearchState> {
        let fresh: Vec<&SearchState> = population
            .iter()
            .filter(|state| !self.emitted.contains(state.fingerprint()))
            .collect();
        let wanted = options.candidates_per_round;
        let explore = (wanted as f64 * options.eps_greedy).round() as usize;
        let greedy = wanted.saturating_sub(explore).min(fresh.len());

        let mut picked: Vec<usize> = (0..greedy).collect();
        let mut rest: Vec<usize> = (greedy..fresh.len()).collect();
        while picked.len() < wanted && !rest.is_empty() {
            let index = self.rng.usize(..rest.len());
            picked.push(rest.swap_remove(index));
        }

        let chosen: Vec<SearchState> = picked.into_iter().map(|index| fresh[index].clone()).collect();
        for state in &chosen {
            self.emitted.insert(state.fingerprint().to_string());
        }
        chosen
    }
}
