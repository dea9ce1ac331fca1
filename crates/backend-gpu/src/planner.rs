//! GPU launch planning.

use schedforge_ir::{AxisKind, CompileError, LoopAnnotation, LoweredFunc, Target};

/// Largest extent of the first grid dimension.
const MAX_GRID_X: usize = (1 << 31) - 1;
/// Largest extent of the remaining grid dimensions.
const MAX_GRID_YZ: usize = 65_535;

/// How a loop nest is mapped onto the device.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub name: String,
    /// Extents of the parallel loop prefix, one grid dimension each.
    pub grid: Vec<usize>,
    pub blocks: usize,
    /// Serial spatial loops executed by the threads of a block.
    pub thread_loops: Vec<String>,
    pub threads_per_block: usize,
    /// Iteration points executed sequentially by one thread.
    pub work_per_thread: usize,
    pub vector_width: usize,
    pub unroll: usize,
    pub flops_per_point: f64,
    /// Bytes moved between global memory and the device.
    pub bytes: usize,
    /// Adjacent threads touch adjacent output elements.
    pub coalesced: bool,
}

impl LaunchPlan {
    pub fn total_threads(&self) -> usize {
        self.blocks * self.threads_per_block
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GpuPlanner;

impl GpuPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, func: &LoweredFunc, target: &Target) -> Result<LaunchPlan, CompileError> {
        func.verify()
            .map_err(|err| CompileError::Codegen(err.to_string()))?;

        let prefix = func
            .loops
            .iter()
            .take_while(|lp| lp.annotation == LoopAnnotation::Parallel)
            .count();
        if prefix == 0 {
            return Err(CompileError::Codegen(format!(
                "`{}` has no parallel loop to map onto blocks",
                func.name
            )));
        }
        if let Some(lp) = func.loops[prefix..]
            .iter()
            .find(|lp| lp.annotation == LoopAnnotation::Parallel)
        {
            return Err(CompileError::Codegen(format!(
                "parallel loop `{}` does not belong to the outermost band",
                lp.name
            )));
        }

        let grid: Vec<usize> = func.loops[..prefix].iter().map(|lp| lp.extent()).collect();
        for (dim, &extent) in grid.iter().enumerate() {
            let limit = if dim == 0 { MAX_GRID_X } else { MAX_GRID_YZ };
            if extent > limit {
                return Err(CompileError::Resources(format!(
                    "grid dimension {} of extent {} exceeds {}",
                    dim, extent, limit
                )));
            }
        }
        let blocks: usize = grid.iter().product();

        let mut threads = 1usize;
        let mut thread_loops = Vec::new();
        let mut innermost_thread_loop = None;
        for lp in &func.loops[prefix..] {
            if lp.annotation != LoopAnnotation::Serial || lp.touches_reduction(&func.axes) {
                break;
            }
            let widened = threads.saturating_mul(lp.extent());
            if widened > target.max_threads_per_block {
                break;
            }
            threads = widened;
            thread_loops.push(lp.name.clone());
            innermost_thread_loop = Some(lp);
        }

        let vector_width = func
            .loops
            .iter()
            .filter(|lp| lp.annotation == LoopAnnotation::Vectorized)
            .map(|lp| lp.extent())
            .product();
        let unroll = func
            .loops
            .iter()
            .filter(|lp| lp.annotation == LoopAnnotation::Unrolled)
            .map(|lp| lp.extent())
            .product();

        // the fastest varying output axis is the last spatial one
        let fastest_axis = func
            .axes
            .iter()
            .rposition(|axis| axis.kind == AxisKind::Spatial);
        let coalesced = match innermost_thread_loop {
            Some(lp) => lp.parts.last().is_some_and(|part| {
                Some(part.axis) == fastest_axis && part.stride == 1
            }),
            None => false,
        };

        let bytes = func
            .compute
            .inputs()
            .iter()
            .map(|tensor| tensor.size_bytes())
            .sum::<usize>()
            + func.compute.output().size_bytes();

        Ok(LaunchPlan {
            name: func.name.clone(),
            grid,
            blocks,
            thread_loops,
            threads_per_block: threads,
            work_per_thread: func.iteration_points() / (blocks * threads),
            vector_width,
            unroll,
            flops_per_point: func.compute.flops_per_point(),
            bytes,
            coalesced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schedforge_ir::{FuncBuilder, ScheduleDesc, ScheduleStep};

    #[test]
    fn blocks_come_from_the_parallel_prefix() -> anyhow::Result<()> {
        let func = ScheduleDesc::new(vec![ScheduleStep::Parallel { lp: "i".into() }])
            .replay(&FuncBuilder::new("mm").matmul(64, 128, 16)?)?;
        let plan = GpuPlanner::new().plan(&func, &Target::gpu(8))?;
        assert_eq!(plan.grid, vec![64]);
        assert_eq!(plan.thread_loops, vec!["j".to_string()]);
        assert_eq!(plan.threads_per_block, 128);
        // k stays inside each thread
        assert_eq!(plan.work_per_thread, 16);
        assert!(plan.coalesced);
        Ok(())
    }

    #[test]
    fn thread_mapping_stops_at_block_limit() -> anyhow::Result<()> {
        let func = ScheduleDesc::new(vec![
            ScheduleStep::Split {
                lp: "i".into(),
                factor: 64,
            },
            ScheduleStep::Parallel { lp: "i.o".into() },
        ])
        .replay(&FuncBuilder::new("mm").matmul(256, 256, 8)?)?;
        let plan = GpuPlanner::new().plan(&func, &Target::gpu(8))?;
        // i.i (64) fits, j (256) would exceed 1024 threads
        assert_eq!(plan.threads_per_block, 64);
        assert!(!plan.coalesced);
        Ok(())
    }

    #[test]
    fn nest_without_parallel_loop_is_rejected() -> anyhow::Result<()> {
        let func = FuncBuilder::new("mm").matmul(8, 8, 8)?;
        assert!(matches!(
            GpuPlanner::new().plan(&func, &Target::gpu(4)),
            Err(CompileError::Codegen(_))
        ));
        Ok(())
    }
}
