//! Simulated GPU execution with an analytical occupancy model.

use crate::planner::{GpuPlanner, LaunchPlan};
use schedforge_ir::{
    Arch, Backend, CompileError, DynExecutable, Executable, Execution, LoweredFunc, RunContext,
    RuntimeError, Target,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Throughput and occupancy parameters of the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceModel {
    pub warp_size: usize,
    /// Resident blocks per streaming multiprocessor.
    pub blocks_per_sm: usize,
    /// Warps issued per cycle by one multiprocessor.
    pub warp_schedulers: usize,
    /// Floating point operations per nanosecond for a single lane.
    pub lane_flops_per_ns: f64,
    /// Global memory bytes per nanosecond.
    pub bytes_per_ns: f64,
    pub uncoalesced_penalty: f64,
    pub launch_overhead: Duration,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self {
            warp_size: 32,
            blocks_per_sm: 4,
            warp_schedulers: 4,
            lane_flops_per_ns: 1.0,
            bytes_per_ns: 400.0,
            uncoalesced_penalty: 4.0,
            launch_overhead: Duration::from_micros(5),
        }
    }
}

impl DeviceModel {
    /// Modeled kernel latency of `plan` on a device with `sm_count` multiprocessors.
    pub fn estimate(&self, plan: &LaunchPlan, sm_count: usize) -> Duration {
        let sms = sm_count.max(1);
        let resident = sms * self.blocks_per_sm;
        let waves = plan.blocks.div_ceil(resident);

        let warps_per_block = plan.threads_per_block.div_ceil(self.warp_size);
        let blocks_on_sm = self.blocks_per_sm.min(plan.blocks.div_ceil(sms));
        let issue_rounds = (warps_per_block * blocks_on_sm).div_ceil(self.warp_schedulers);

        let ilp = 1.0
            + 0.25 * (plan.vector_width.max(1) as f64).log2()
            + 0.125 * (plan.unroll.max(1) as f64).log2();
        let thread_ns =
            plan.work_per_thread as f64 * plan.flops_per_point / (self.lane_flops_per_ns * ilp);
        let compute_ns = waves as f64 * issue_rounds as f64 * thread_ns;

        let mut memory_ns = plan.bytes as f64 / self.bytes_per_ns;
        if !plan.coalesced {
            memory_ns *= self.uncoalesced_penalty;
        }

        self.launch_overhead + Duration::from_secs_f64(compute_ns.max(memory_ns) * 1e-9)
    }
}

/// Code generation collaborator for GPU targets.
#[derive(Debug, Default, Clone)]
pub struct GpuBackend {
    planner: GpuPlanner,
    device: DeviceModel,
}

impl GpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: DeviceModel) -> Self {
        Self {
            planner: GpuPlanner::new(),
            device,
        }
    }
}

impl Backend for GpuBackend {
    fn name(&self) -> &str {
        "gpu-occupancy-model"
    }

    fn arch(&self) -> Arch {
        Arch::Gpu
    }

    fn compile(&self, func: &LoweredFunc, target: &Target) -> Result<DynExecutable, CompileError> {
        if target.arch != Arch::Gpu {
            return Err(CompileError::UnsupportedTarget {
                backend: self.name().to_string(),
                arch: target.arch,
            });
        }
        let plan = self.planner.plan(func, target)?;
        let latency = self.device.estimate(&plan, target.compute_units);
        debug!(
            func = %plan.name,
            blocks = plan.blocks,
            threads = plan.threads_per_block,
            coalesced = plan.coalesced,
            latency_us = latency.as_secs_f64() * 1e6,
            "planned gpu launch"
        );
        Ok(Arc::new(GpuExecutable { plan, latency }))
    }
}

pub struct GpuExecutable {
    plan: LaunchPlan,
    latency: Duration,
}

impl GpuExecutable {
    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }
}

impl Executable for GpuExecutable {
    fn run(&self, ctx: &RunContext) -> Result<Execution, RuntimeError> {
        ctx.check()?;
        if let Some(deadline) = ctx.deadline {
            if Instant::now() + self.latency > deadline {
                return Err(RuntimeError::Timeout);
            }
        }
        Ok(Execution {
            elapsed: self.latency,
            output: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schedforge_ir::{FuncBuilder, ScheduleDesc, ScheduleStep};

    fn compile(schedule: Vec<ScheduleStep>) -> anyhow::Result<DynExecutable> {
        let baseline = FuncBuilder::new("mm").matmul(256, 256, 64)?;
        let func = ScheduleDesc::new(schedule).replay(&baseline)?;
        Ok(GpuBackend::new().compile(&func, &Target::gpu(8))?)
    }

    fn latency(exe: &DynExecutable) -> anyhow::Result<Duration> {
        Ok(exe.run(&RunContext::new(0))?.elapsed)
    }

    #[test]
    fn wide_blocks_beat_a_starved_grid() -> anyhow::Result<()> {
        let wide = compile(vec![ScheduleStep::Parallel { lp: "i".into() }])?;
        let starved = compile(vec![
            ScheduleStep::Split {
                lp: "i".into(),
                factor: 64,
            },
            ScheduleStep::Parallel { lp: "i.o".into() },
        ])?;
        assert!(latency(&wide)? < latency(&starved)?);
        Ok(())
    }

    #[test]
    fn latency_is_deterministic() -> anyhow::Result<()> {
        let exe = compile(vec![ScheduleStep::Parallel { lp: "i".into() }])?;
        assert_eq!(latency(&exe)?, latency(&exe)?);
        Ok(())
    }

    #[test]
    fn modeled_latency_past_deadline_times_out() -> anyhow::Result<()> {
        let exe = compile(vec![ScheduleStep::Parallel { lp: "i".into() }])?;
        let ctx = RunContext::new(0).with_deadline(Instant::now() + Duration::from_nanos(1));
        assert!(matches!(exe.run(&ctx), Err(RuntimeError::Timeout)));
        Ok(())
    }

    #[test]
    fn backend_rejects_cpu_targets() -> anyhow::Result<()> {
        let func = ScheduleDesc::new(vec![ScheduleStep::Parallel { lp: "i".into() }])
            .replay(&FuncBuilder::new("mm").matmul(8, 8, 8)?)?;
        assert!(matches!(
            GpuBackend::new().compile(&func, &Target::cpu(4)),
            Err(CompileError::UnsupportedTarget { .. })
        ));
        Ok(())
    }
}
