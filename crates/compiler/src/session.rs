//! Tuning session orchestration.

use crate::pipeline::default_backends;
use anyhow::{Context, Result};
use rayon::prelude::*;
use schedforge_autotune::{
    CostModel, Database, MeasureOptions, ScheduleMeasurer, SharedCostModel, TuneTask,
    DEFAULT_CAPACITY,
};
use schedforge_ir::{BackendRegistry, Lowerer, ScheduleLowerer};
use schedforge_optimizer::{CancellationToken, OptimizedComputeExpr, TaskOptimizer, TuningOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Persistent database; `None` keeps results in memory.
    pub database_path: Option<PathBuf>,
    pub database_capacity: usize,
    pub measure: MeasureOptions,
    /// Tasks tuned concurrently.
    pub task_workers: usize,
    /// One cost model trained by every task instead of one per task.
    pub share_cost_model: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            database_path: None,
            database_capacity: DEFAULT_CAPACITY,
            measure: MeasureOptions::default(),
            task_workers: 1,
            share_cost_model: false,
        }
    }
}

/// Tunes many tasks against one measurer and one database.
pub struct TuningSession {
    measurer: Arc<ScheduleMeasurer>,
    database: Arc<Database>,
    cost_model: Option<SharedCostModel>,
    cancel: CancellationToken,
    pool: rayon::ThreadPool,
}

impl TuningSession {
    pub fn new(
        lowerer: Arc<dyn Lowerer>,
        backends: BackendRegistry,
        options: SessionOptions,
    ) -> Result<Self> {
        anyhow::ensure!(options.task_workers > 0, "task_workers must be > 0");
        let measurer = ScheduleMeasurer::new(lowerer, backends, options.measure)?;
        let database = match &options.database_path {
            Some(path) => Database::open(path, options.database_capacity),
            None => Database::in_memory(options.database_capacity),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.task_workers)
            .thread_name(|index| format!("schedforge-task-{}", index))
            .build()
            .context("building task pool")?;
        Ok(Self {
            measurer: Arc::new(measurer),
            database: Arc::new(database),
            cost_model: options
                .share_cost_model
                .then(|| CostModel::default().shared()),
            cancel: CancellationToken::new(),
            pool,
        })
    }

    /// Schedule replay lowering with the default backends.
    pub fn with_defaults(options: SessionOptions) -> Result<Self> {
        Self::new(Arc::new(ScheduleLowerer::new()), default_backends(), options)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn measurer(&self) -> &Arc<ScheduleMeasurer> {
        &self.measurer
    }

    pub fn shared_cost_model(&self) -> Option<&SharedCostModel> {
        self.cost_model.as_ref()
    }

    /// Cancelling the returned token stops every task at its next round.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tune every task and persist the database; results follow `tasks` order.
    ///
    /// A failing task does not stop the others. The database is saved with
    /// everything measured before the first error is returned.
    pub fn tune_all(
        &self,
        tasks: &[Arc<TuneTask>],
        options: &TuningOptions,
    ) -> Result<Vec<OptimizedComputeExpr>> {
        info!(tasks = tasks.len(), "starting tuning session");
        let outcomes: Vec<Result<OptimizedComputeExpr>> = self.pool.install(|| {
            tasks
                .par_iter()
                .map(|task| self.tune(task, options))
                .collect()
        });
        self.save()?;
        for (task, outcome) in tasks.iter().zip(&outcomes) {
            if let Err(err) = outcome {
                warn!(task = %task.name, error = %format!("{:#}", err), "task failed");
            }
        }
        let results = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
        let improved = results.iter().filter(|result| result.improved).count();
        info!(tasks = results.len(), improved, "tuning session finished");
        Ok(results)
    }

    pub fn tune(&self, task: &Arc<TuneTask>, options: &TuningOptions) -> Result<OptimizedComputeExpr> {
        let mut optimizer = TaskOptimizer::new(
            Arc::clone(task),
            Arc::clone(&self.measurer),
            Arc::clone(&self.database),
        )
        .with_cancellation(self.cancel.clone());
        if let Some(model) = &self.cost_model {
            optimizer = optimizer.with_shared_cost_model(Arc::clone(model));
        }
        optimizer
            .optimize(options)
            .with_context(|| format!("tuning {}", task))
    }

    pub fn save(&self) -> Result<()> {
        self.database.save()
    }
}
