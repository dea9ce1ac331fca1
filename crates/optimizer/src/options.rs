//! Tuning options: the knobs of one tuning run.
//!
//! Options are supplied by the caller and never mutated while tuning.

use serde::{Deserialize, Serialize};

/// Search and budget parameters for [`crate::TaskOptimizer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningOptions {
    /// States kept alive in the evolutionary population.
    pub population_size: usize,
    /// Evolution steps per search round.
    pub generations: usize,
    /// Candidates handed to the measurer per round.
    pub candidates_per_round: usize,
    /// Upper bound on search rounds.
    pub max_rounds: usize,
    /// Upper bound on measured candidates over the whole run.
    pub num_measure_trials: usize,
    /// Stop after this many consecutive rounds without a successful measurement.
    pub max_retry_continuous_empty: usize,
    /// Share of the population seeded from the database.
    pub seed_ratio: f64,
    /// Probability that an offspring comes from crossover instead of mutation.
    pub crossover_prob: f64,
    pub tournament_size: usize,
    /// Share of the measured candidates picked at random for exploration.
    pub eps_greedy: f64,
    /// Longest random walk used to fill the initial population.
    pub init_walk_depth: usize,
    pub seed: u64,
}

impl Default for TuningOptions {
    fn default() -> Self {
        Self {
            population_size: 32,
            generations: 4,
            candidates_per_round: 8,
            max_rounds: 16,
            num_measure_trials: 64,
            max_retry_continuous_empty: 3,
            seed_ratio: 0.5,
            crossover_prob: 0.3,
            tournament_size: 3,
            eps_greedy: 0.05,
            init_walk_depth: 3,
            seed: 42,
        }
    }
}

impl TuningOptions {
    /// Small budgets for smoke runs.
    pub fn quick() -> Self {
        Self {
            population_size: 12,
            generations: 2,
            candidates_per_round: 4,
            max_rounds: 3,
            num_measure_trials: 12,
            ..Default::default()
        }
    }

    /// Options that measure nothing and return the baseline.
    pub fn no_measurement() -> Self {
        Self {
            max_rounds: 0,
            num_measure_trials: 0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.population_size == 0 {
            return Err("population_size must be > 0".into());
        }
        if self.candidates_per_round == 0 {
            return Err("candidates_per_round must be > 0".into());
        }
        if self.tournament_size == 0 {
            return Err("tournament_size must be > 0".into());
        }
        if self.max_retry_continuous_empty == 0 {
            return Err("max_retry_continuous_empty must be > 0".into());
        }
        for (name, value) in [
            ("seed_ratio", self.seed_ratio),
            ("crossover_prob", self.crossover_prob),
            ("eps_greedy", self.eps_greedy),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be in [0, 1], got {}", name, value));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_valid() {
        assert!(TuningOptions::default().validate().is_ok());
        assert!(TuningOptions::quick().validate().is_ok());
        assert!(TuningOptions::no_measurement().validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        let options = TuningOptions {
            eps_greedy: 1.5,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = TuningOptions {
            population_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_fill_missing_fields() {
        let options: TuningOptions = serde_json::from_str(r#"{"max_rounds": 2}"#).unwrap();
        assert_eq!(options.max_rounds, 2);
        assert_eq!(options.max_retry_continuous_empty, 3);
    }
}
