//! Turning a tuning result into something that runs.

use anyhow::{Context, Result};
use schedforge_autotune::TuneTask;
use schedforge_backend_cpu::CpuBackend;
use schedforge_backend_gpu::GpuBackend;
use schedforge_ir::{
    BackendRegistry, DynExecutable, Executable, Execution, LoweredFunc, Lowerer, RunContext,
};
use schedforge_optimizer::OptimizedComputeExpr;
use tracing::info;

/// CPU and simulated GPU backends.
pub fn default_backends() -> BackendRegistry {
    BackendRegistry::new()
        .with_backend(CpuBackend::new())
        .with_backend(GpuBackend::new())
}

/// A lowered, compiled function ready to execute.
pub struct Materialized {
    pub func: LoweredFunc,
    pub backend: String,
    executable: DynExecutable,
}

impl Materialized {
    pub fn executable(&self) -> &DynExecutable {
        &self.executable
    }

    /// One execution with output capture.
    pub fn run(&self, seed: u64) -> Result<Execution> {
        let ctx = RunContext::new(seed).capturing_output();
        Ok(self.executable.run(&ctx)?)
    }
}

/// Lower the selected schedule of `result` for `task` and compile it.
pub fn materialize(
    task: &TuneTask,
    result: &OptimizedComputeExpr,
    lowerer: &dyn Lowerer,
    backends: &BackendRegistry,
) -> Result<Materialized> {
    anyhow::ensure!(
        result.fingerprint == task.fingerprint(),
        "result for task {} does not belong to {}",
        result.task,
        task
    );
    let func = lowerer
        .lower(&task.baseline, &result.schedule, &task.target)
        .with_context(|| format!("lowering the schedule selected for {}", task.name))?;
    let backend = backends
        .find(task.target.arch)
        .with_context(|| format!("no backend registered for {}", task.target.arch))?;
    let executable = backend
        .compile(&func, &task.target)
        .with_context(|| format!("compiling {} with {}", task.name, backend.name()))?;
    info!(
        task = %task.name,
        backend = backend.name(),
        steps = result.schedule.len(),
        "materialized tuned function"
    );
    Ok(Materialized {
        func,
        backend: backend.name().to_string(),
        executable,
    })
}
