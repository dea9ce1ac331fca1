//! Learned cost model for ranking candidate schedules.
//!
//! Prediction is split into two stages. [`extract_features`] turns a loop
//! nest into a fixed-length vector (versioned by [`FEATURE_VERSION`]); the
//! model combines a structural heuristic with a ridge regression on the log
//! ratio between measured and heuristic cost. With no training data the
//! regression is zero and predictions are the heuristic itself.

use crate::state::SearchState;
use crate::task::TuneTask;
use anyhow::{ensure, Context, Result};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use schedforge_ir::{Arch, AxisKind, LoopAnnotation, LoweredFunc, Target};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Bumped whenever the meaning or order of features changes.
pub const FEATURE_VERSION: u32 = 1;
pub const NUM_FEATURES: usize = 12;

pub type Features = [f64; NUM_FEATURES];

/// Cost model shared by several task optimizers.
pub type SharedCostModel = Arc<RwLock<CostModel>>;

/// Resident GPU threads per multiprocessor assumed by the heuristic.
const GPU_LANES_PER_UNIT: usize = 128;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeatureExtractionError {
    #[error("`{func}` has an empty loop nest")]
    EmptyNest { func: String },
    #[error("`{func}` is malformed: {reason}")]
    Malformed { func: String, reason: String },
}

/// Raw structural quantities of a loop nest on a target.
#[derive(Debug, Clone, Copy)]
struct Structure {
    flops: f64,
    bytes: f64,
    parallelism: f64,
    imbalance: f64,
    vector_width: f64,
    unroll: f64,
    unit_stride_inner: bool,
    reduction_inner: bool,
    inner_extent: f64,
    depth: f64,
    split_fraction: f64,
    fused: f64,
}

impl Structure {
    fn extract(func: &LoweredFunc, target: &Target) -> Result<Self, FeatureExtractionError> {
        func.verify()
            .map_err(|err| FeatureExtractionError::Malformed {
                func: func.name.clone(),
                reason: err.to_string(),
            })?;
        let Some(innermost) = func.loops.last() else {
            return Err(FeatureExtractionError::EmptyNest {
                func: func.name.clone(),
            });
        };

        let annotated = |annotation: LoopAnnotation| {
            func.loops
                .iter()
                .filter(move |lp| lp.annotation == annotation)
                .map(|lp| lp.extent())
        };

        let parallel_extent: usize = annotated(LoopAnnotation::Parallel).product();
        let has_parallel = annotated(LoopAnnotation::Parallel).next().is_some();
        let units = target.compute_units.max(1);
        let (parallelism, imbalance) = if !has_parallel {
            (1.0, 0.0)
        } else {
            match target.arch {
                Arch::Cpu => {
                    let waves = parallel_extent.div_ceil(units);
                    let imbalance = if parallel_extent >= units {
                        (waves * units) as f64 / parallel_extent as f64 - 1.0
                    } else {
                        0.0
                    };
                    (parallel_extent.min(units) as f64, imbalance)
                }
                Arch::Gpu => {
                    let threads = block_threads(func, target);
                    let lanes = parallel_extent.saturating_mul(threads);
                    ((lanes.min(units * GPU_LANES_PER_UNIT)) as f64, 0.0)
                }
            }
        };

        let fastest_axis = func
            .axes
            .iter()
            .rposition(|axis| axis.kind == AxisKind::Spatial);
        let unit_stride_inner = innermost
            .parts
            .last()
            .is_some_and(|part| Some(part.axis) == fastest_axis && part.stride == 1);

        let split_axes = (0..func.axes.len())
            .filter(|&axis| {
                func.loops
                    .iter()
                    .flat_map(|lp| lp.parts.iter())
                    .filter(|part| part.axis == axis)
                    .count()
                    > 1
            })
            .count();

        let bytes = func
            .compute
            .inputs()
            .iter()
            .map(|tensor| tensor.size_bytes())
            .sum::<usize>()
            + func.compute.output().size_bytes();

        Ok(Self {
            flops: func.total_flops(),
            bytes: bytes as f64,
            parallelism,
            imbalance,
            vector_width: annotated(LoopAnnotation::Vectorized).product::<usize>() as f64,
            unroll: annotated(LoopAnnotation::Unrolled).product::<usize>() as f64,
            unit_stride_inner,
            reduction_inner: innermost.is_reduction(&func.axes),
            inner_extent: innermost.extent() as f64,
            depth: func.loops.len() as f64,
            split_fraction: split_axes as f64 / func.axes.len().max(1) as f64,
            fused: func.loops.iter().filter(|lp| lp.is_fused()).count() as f64,
        })
    }

    fn features(&self) -> Features {
        let flag = |value: bool| if value { 1.0 } else { 0.0 };
        [
            self.flops.ln_1p(),
            self.bytes.ln_1p(),
            self.parallelism.ln(),
            self.imbalance,
            self.vector_width.ln(),
            self.unroll.ln(),
            flag(self.unit_stride_inner),
            flag(self.reduction_inner),
            self.inner_extent.ln(),
            self.depth,
            self.split_fraction,
            self.fused,
        ]
    }

    /// Structural estimate in milliseconds, used before any training data exists.
    fn heuristic_cost(&self) -> f64 {
        let simd = if self.unit_stride_inner {
            self.vector_width
        } else {
            1.0 + (self.vector_width - 1.0) * 0.25
        };
        let unroll_gain = 1.0 + 0.1 * self.unroll.log2();
        let locality = if self.unit_stride_inner {
            1.0
        } else if self.reduction_inner {
            1.2
        } else {
            2.0
        };
        let tiling = 1.0 + 0.1 * self.split_fraction;
        let compute = self.flops * 1e-6 * (1.0 + self.imbalance) * locality
            / (self.parallelism * simd * unroll_gain * tiling);
        compute + 1e-3 * self.depth
    }
}

/// Threads a GPU block would get from the serial spatial loops after the grid.
fn block_threads(func: &LoweredFunc, target: &Target) -> usize {
    let mut threads = 1usize;
    for lp in func
        .loops
        .iter()
        .skip_while(|lp| lp.annotation == LoopAnnotation::Parallel)
    {
        if lp.annotation != LoopAnnotation::Serial || lp.touches_reduction(&func.axes) {
            break;
        }
        let widened = threads.saturating_mul(lp.extent());
        if widened > target.max_threads_per_block {
            break;
        }
        threads = widened;
    }
    threads
}

/// Feature vector of `func` on `target`.
pub fn extract_features(
    func: &LoweredFunc,
    target: &Target,
) -> Result<Features, FeatureExtractionError> {
    Structure::extract(func, target).map(|structure| structure.features())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostModelConfig {
    /// L2 penalty pulling weights towards the prior.
    pub ridge: f64,
    /// Most recent samples kept for refitting.
    pub window: usize,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            ridge: 0.1,
            window: 2048,
        }
    }
}

impl CostModelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.ridge.is_finite() && self.ridge > 0.0) {
            return Err("ridge must be a positive number".into());
        }
        if self.window == 0 {
            return Err("window must be > 0".into());
        }
        Ok(())
    }
}

/// Persistable regression parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelParams {
    pub feature_version: u32,
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Training samples seen over the model's lifetime.
    pub samples: usize,
}

impl ModelParams {
    pub fn untrained() -> Self {
        Self {
            feature_version: FEATURE_VERSION,
            weights: vec![0.0; NUM_FEATURES],
            bias: 0.0,
            samples: 0,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let params: Self = serde_json::from_slice(&data)?;
        ensure!(
            params.feature_version == FEATURE_VERSION,
            "model was trained on feature version {}, expected {}",
            params.feature_version,
            FEATURE_VERSION
        );
        ensure!(
            params.weights.len() == NUM_FEATURES,
            "model has {} weights, expected {}",
            params.weights.len(),
            NUM_FEATURES
        );
        Ok(params)
    }
}

#[derive(Debug, Clone)]
struct Sample {
    features: Features,
    /// `ln(measured) - ln(heuristic)`
    residual: f64,
}

/// Heuristic prior corrected by ridge regression on measured samples.
#[derive(Debug, Clone)]
pub struct CostModel {
    config: CostModelConfig,
    params: ModelParams,
    /// Weights the regression shrinks towards.
    prior: Vec<f64>,
    window: VecDeque<Sample>,
    version: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new(CostModelConfig::default())
    }
}

impl CostModel {
    pub fn new(config: CostModelConfig) -> Self {
        Self {
            config,
            params: ModelParams::untrained(),
            prior: vec![0.0; NUM_FEATURES],
            window: VecDeque::new(),
            version: 0,
        }
    }

    /// Continue from previously trained parameters.
    pub fn from_params(config: CostModelConfig, params: ModelParams) -> Self {
        Self {
            config,
            prior: params.weights.clone(),
            params,
            window: VecDeque::new(),
            version: 0,
        }
    }

    pub fn shared(self) -> SharedCostModel {
        Arc::new(RwLock::new(self))
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Incremented by every update that changed the parameters.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_samples(&self) -> usize {
        self.params.samples
    }

    /// Predicted cost of `state`; lower is better.
    pub fn predict(
        &self,
        task: &TuneTask,
        state: &SearchState,
    ) -> Result<f64, FeatureExtractionError> {
        let structure = Structure::extract(state.func(), &task.target)?;
        let features = structure.features();
        let correction =
            (self.params.bias + dot(&self.params.weights, &features)).clamp(-20.0, 20.0);
        Ok(structure.heuristic_cost() * correction.exp())
    }

    pub fn predict_batch(
        &self,
        task: &TuneTask,
        states: &[&SearchState],
    ) -> Result<Vec<f64>, FeatureExtractionError> {
        states
            .par_iter()
            .map(|state| self.predict(task, state))
            .collect()
    }

    /// Train on a batch of measured states and refit.
    pub fn update(
        &mut self,
        task: &TuneTask,
        batch: &[(&SearchState, f64)],
    ) -> Result<(), FeatureExtractionError> {
        let mut added = 0usize;
        for (state, cost) in batch {
            if !cost.is_finite() || *cost < 0.0 {
                debug!(state = state.fingerprint(), cost, "skipping unusable training sample");
                continue;
            }
            let structure = Structure::extract(state.func(), &task.target)?;
            let residual = cost.max(1e-9).ln() - structure.heuristic_cost().ln();
            self.window.push_back(Sample {
                features: structure.features(),
                residual,
            });
            added += 1;
        }
        if added == 0 {
            return Ok(());
        }
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }
        self.params.samples += added;
        self.refit();
        self.version += 1;
        debug!(
            task = %task.name,
            added,
            window = self.window.len(),
            version = self.version,
            "cost model updated"
        );
        Ok(())
    }

    fn refit(&mut self) {
        let n = self.window.len();
        let mut x = Array2::<f64>::zeros((n, NUM_FEATURES));
        let mut y = Array1::<f64>::zeros(n);
        for (row, sample) in self.window.iter().enumerate() {
            for (col, value) in sample.features.iter().enumerate() {
                x[[row, col]] = *value;
            }
            y[row] = sample.residual;
        }
        let (Some(x_mean), Some(y_mean)) = (x.mean_axis(Axis(0)), y.mean()) else {
            return;
        };
        let xc = &x - &x_mean;
        let yc = &y - y_mean;

        let prior = Array1::from(self.prior.clone());
        let gram = xc.t().dot(&xc) + Array2::<f64>::eye(NUM_FEATURES) * self.config.ridge;
        let rhs = xc.t().dot(&yc) + &prior * self.config.ridge;
        let Some(weights) = solve(gram, rhs) else {
            warn!(samples = n, "cost model refit is singular; keeping previous weights");
            return;
        };
        self.params.bias = y_mean - x_mean.dot(&weights);
        self.params.weights = weights.to_vec();
    }
}

fn dot(weights: &[f64], features: &Features) -> f64 {
    weights.iter().zip(features).map(|(w, f)| w * f).sum()
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&p, &q| a[[p, col]].abs().total_cmp(&a[[q, col]].abs()))?;
        if a[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                let delta = factor * a[[col, k]];
                a[[row, k]] -= delta;
            }
            let delta = factor * b[col];
            b[row] -= delta;
        }
    }
    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schedforge_ir::{FuncBuilder, ScheduleDesc, ScheduleStep};

    fn task() -> TuneTask {
        let func = FuncBuilder::new("mm")
            .matmul(64, 64, 32)
            .expect("valid matmul");
        TuneTask::new("mm", func, Target::cpu(4)).expect("valid task")
    }

    fn state(task: &TuneTask, steps: Vec<ScheduleStep>, sequence: u64) -> SearchState {
        SearchState::from_schedule(task, ScheduleDesc::new(steps), sequence).expect("replayable")
    }

    fn parallel_vectorized(task: &TuneTask) -> SearchState {
        state(
            task,
            vec![
                ScheduleStep::Parallel { lp: "i".into() },
                ScheduleStep::Reorder {
                    first: "j".into(),
                    second: "k".into(),
                },
                ScheduleStep::Vectorize {
                    lp: "j".into(),
                    width: 8,
                },
            ],
            1,
        )
    }

    #[test]
    fn prediction_is_deterministic() -> anyhow::Result<()> {
        let task = task();
        let model = CostModel::default();
        let candidate = parallel_vectorized(&task);
        assert_eq!(model.predict(&task, &candidate)?, model.predict(&task, &candidate)?);
        Ok(())
    }

    #[test]
    fn cold_start_ranks_parallel_vectorized_first() -> anyhow::Result<()> {
        let task = task();
        let model = CostModel::default();
        let baseline = model.predict(&task, &task.baseline_state())?;
        let tuned = model.predict(&task, &parallel_vectorized(&task))?;
        assert!(tuned < baseline, "{} !< {}", tuned, baseline);
        Ok(())
    }

    #[test]
    fn malformed_nest_fails_extraction() -> anyhow::Result<()> {
        let task = task();
        let mut func = task.baseline.clone();
        func.loops[0].parts[0].extent = 3;
        let broken = SearchState::new(ScheduleDesc::default(), func, 9);
        assert!(matches!(
            CostModel::default().predict(&task, &broken),
            Err(FeatureExtractionError::Malformed { .. })
        ));
        Ok(())
    }

    #[test]
    fn update_moves_predictions_towards_measurements() -> anyhow::Result<()> {
        let task = task();
        let mut model = CostModel::default();
        let baseline = task.baseline_state();
        let tuned = parallel_vectorized(&task);
        model.update(&task, &[(&baseline, 10.0), (&tuned, 1.0)])?;
        assert_eq!(model.version(), 1);
        assert_eq!(model.num_samples(), 2);

        let predicted = model.predict(&task, &baseline)?;
        assert!((5.0..20.0).contains(&predicted), "{}", predicted);
        assert!(model.predict(&task, &tuned)? < predicted);
        Ok(())
    }

    #[test]
    fn empty_update_keeps_version() -> anyhow::Result<()> {
        let task = task();
        let mut model = CostModel::default();
        let baseline = task.baseline_state();
        model.update(&task, &[(&baseline, f64::NAN)])?;
        assert_eq!(model.version(), 0);
        Ok(())
    }

    #[test]
    fn batch_prediction_matches_single() -> anyhow::Result<()> {
        let task = task();
        let model = CostModel::default();
        let states = vec![task.baseline_state(), parallel_vectorized(&task)];
        let refs: Vec<&SearchState> = states.iter().collect();
        let batch = model.predict_batch(&task, &refs)?;
        for (state, cost) in states.iter().zip(batch) {
            assert_eq!(model.predict(&task, state)?, cost);
        }
        Ok(())
    }

    #[test]
    fn params_survive_a_save_load_cycle() -> anyhow::Result<()> {
        let task = task();
        let mut model = CostModel::default();
        let baseline = task.baseline_state();
        let tuned = parallel_vectorized(&task);
        model.update(&task, &[(&baseline, 12.0), (&tuned, 2.0)])?;

        let path = std::env::temp_dir().join(format!("schedforge-model-{}.json", std::process::id()));
        model.params().save(&path)?;
        let restored = CostModel::from_params(CostModelConfig::default(), ModelParams::load(&path)?);
        let _ = fs::remove_file(&path);

        let expected = model.predict(&task, &tuned)?;
        let got = restored.predict(&task, &tuned)?;
        assert!((expected - got).abs() <= expected.abs() * 1e-9);
        assert_eq!(restored.num_samples(), 2);
        Ok(())
    }

    #[test]
    fn solver_handles_pivoting() {
        let a = ndarray::arr2(&[[0.0, 2.0], [3.0, 1.0]]);
        let b = ndarray::arr1(&[4.0, 5.0]);
        let x = solve(a, b).expect("non-singular");
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }
}
