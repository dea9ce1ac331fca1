//! CPU runtime entrypoints.

use crate::planner::{CpuPlanner, CpuProgram, Statement};
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use schedforge_ir::{
    Arch, Backend, CompileError, DynExecutable, Executable, Execution, LoweredFunc, RunContext,
    RuntimeError, Target,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Statements executed between two deadline checks.
const CHECK_INTERVAL: u64 = 1 << 14;

/// Code generation collaborator for the host CPU.
#[derive(Debug, Default, Clone)]
pub struct CpuBackend {
    planner: CpuPlanner,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            planner: CpuPlanner::new(),
        }
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu-loop-program"
    }

    fn arch(&self) -> Arch {
        Arch::Cpu
    }

    fn compile(&self, func: &LoweredFunc, target: &Target) -> Result<DynExecutable, CompileError> {
        if target.arch != Arch::Cpu {
            return Err(CompileError::UnsupportedTarget {
                backend: self.name().to_string(),
                arch: target.arch,
            });
        }
        let program = self.planner.plan(func)?;
        debug!(
            func = %program.name,
            loops = program.loops.len(),
            parallel = program.parallel_outer,
            "compiled cpu loop program"
        );
        Ok(Arc::new(CpuExecutable::new(program)))
    }
}

/// Synthetic operands for one run.
pub fn random_inputs(shapes: &[Vec<usize>], seed: u64) -> Vec<ArrayD<f32>> {
    let mut rng = fastrand::Rng::with_seed(seed);
    shapes
        .iter()
        .map(|shape| ArrayD::from_shape_fn(IxDyn(shape), |_| rng.f32() * 2.0 - 1.0))
        .collect()
}

pub struct CpuExecutable {
    program: CpuProgram,
}

impl CpuExecutable {
    pub fn new(program: CpuProgram) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &CpuProgram {
        &self.program
    }

    /// Evaluate the program on explicit inputs and return the output tensor.
    pub fn evaluate(
        &self,
        inputs: &[ArrayD<f32>],
        ctx: &RunContext,
    ) -> Result<ArrayD<f32>, RuntimeError> {
        let program = &self.program;
        if inputs.len() != program.input_shapes.len() {
            return Err(RuntimeError::Crashed(format!(
                "expected {} inputs, got {}",
                program.input_shapes.len(),
                inputs.len()
            )));
        }
        let buffers = inputs
            .iter()
            .zip(&program.input_shapes)
            .map(|(input, shape)| {
                if input.shape() != shape.as_slice() {
                    return Err(RuntimeError::Crashed(format!(
                        "input shape {:?} does not match {:?}",
                        input.shape(),
                        shape
                    )));
                }
                input
                    .as_slice()
                    .ok_or_else(|| RuntimeError::Crashed("input is not contiguous".into()))
            })
            .collect::<Result<Vec<&[f32]>, RuntimeError>>()?;

        let output = if program.parallel_outer {
            self.run_parallel(&buffers, ctx)?
        } else {
            let mut output = vec![0.0f32; program.output_len()];
            let mut walker = NestWalker::new(program, &buffers, ctx);
            walker.walk(0, &[0; MAX_OPERANDS], &mut output)?;
            output
        };

        ArrayD::from_shape_vec(IxDyn(&program.output_shape), output)
            .map_err(|err| RuntimeError::Crashed(err.to_string()))
    }

    fn run_parallel(&self, buffers: &[&[f32]], ctx: &RunContext) -> Result<Vec<f32>, RuntimeError> {
        let program = &self.program;
        let outer = &program.loops[0];
        let len = program.output_len();
        (0..outer.extent)
            .into_par_iter()
            .try_fold(
                || vec![0.0f32; len],
                |mut output, value| {
                    let mut base = [0usize; MAX_OPERANDS];
                    let row = &outer.offsets[value * program.operands..][..program.operands];
                    base[..program.operands].copy_from_slice(row);
                    let mut walker = NestWalker::new(program, buffers, ctx);
                    walker.walk(1, &base, &mut output)?;
                    Ok(output)
                },
            )
            .try_reduce(
                || vec![0.0f32; len],
                |mut acc, partial| {
                    acc.iter_mut().zip(&partial).for_each(|(a, p)| *a += p);
                    Ok(acc)
                },
            )
    }
}

impl Executable for CpuExecutable {
    fn run(&self, ctx: &RunContext) -> Result<Execution, RuntimeError> {
        ctx.check()?;
        let inputs = random_inputs(&self.program.input_shapes, ctx.seed);
        let start = Instant::now();
        let output = self.evaluate(&inputs, ctx)?;
        let elapsed = start.elapsed();
        Ok(Execution {
            elapsed,
            output: ctx.capture_output.then(|| output.into_raw_vec()),
        })
    }
}

/// Output plus at most two inputs.
const MAX_OPERANDS: usize = 3;

struct NestWalker<'a> {
    program: &'a CpuProgram,
    inputs: &'a [&'a [f32]],
    ctx: &'a RunContext,
    ticks: u64,
}

impl<'a> NestWalker<'a> {
    fn new(program: &'a CpuProgram, inputs: &'a [&'a [f32]], ctx: &'a RunContext) -> Self {
        Self {
            program,
            inputs,
            ctx,
            ticks: 0,
        }
    }

    fn walk(
        &mut self,
        level: usize,
        base: &[usize; MAX_OPERANDS],
        output: &mut [f32],
    ) -> Result<(), RuntimeError> {
        let program = self.program;
        let operands = program.operands;
        let Some(lp) = program.loops.get(level) else {
            self.execute(base, output);
            return self.advance(1);
        };
        let innermost = level + 1 == program.loops.len();
        for row in lp.offsets.chunks_exact(operands) {
            let mut offsets = *base;
            for (slot, delta) in offsets.iter_mut().zip(row) {
                *slot += delta;
            }
            if innermost {
                self.execute(&offsets, output);
            } else {
                self.walk(level + 1, &offsets, output)?;
            }
        }
        if innermost {
            self.advance(lp.extent as u64)?;
        }
        Ok(())
    }

    fn advance(&mut self, statements: u64) -> Result<(), RuntimeError> {
        self.ticks += statements;
        if self.ticks >= CHECK_INTERVAL {
            self.ticks = 0;
            self.ctx.check()?;
        }
        Ok(())
    }

    #[inline]
    fn execute(&self, offsets: &[usize; MAX_OPERANDS], output: &mut [f32]) {
        let out = &mut output[offsets[0]];
        match self.program.statement {
            Statement::MulAccumulate => {
                *out += self.inputs[0][offsets[1]] * self.inputs[1][offsets[2]];
            }
            Statement::Accumulate => {
                *out += self.inputs[0][offsets[1]];
            }
            Statement::Elementwise(op) => {
                let mut args = [0.0f32; MAX_OPERANDS - 1];
                for (arg, (input, &offset)) in args
                    .iter_mut()
                    .zip(self.inputs.iter().zip(&offsets[1..]))
                {
                    *arg = input[offset];
                }
                *out += op.apply(&args[..self.inputs.len()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Ix2};
    use schedforge_ir::{ElementwiseOp, FuncBuilder, ScheduleDesc, ScheduleStep};
    use std::time::Duration;

    fn compile(func: &LoweredFunc) -> CpuExecutable {
        let program = CpuPlanner::new().plan(func).expect("plannable");
        CpuExecutable::new(program)
    }

    #[test]
    fn scheduled_matmul_matches_ndarray_dot() -> anyhow::Result<()> {
        let baseline = FuncBuilder::new("mm").matmul(16, 8, 12)?;
        let schedule = ScheduleDesc::new(vec![
            ScheduleStep::Tile {
                outer: "i".into(),
                inner: "j".into(),
                outer_factor: 4,
                inner_factor: 2,
            },
            ScheduleStep::Reorder {
                first: "j.i".into(),
                second: "k".into(),
            },
            ScheduleStep::Parallel { lp: "i.o".into() },
        ]);
        let func = schedule.replay(&baseline)?;
        let exe = compile(&func);

        let inputs = random_inputs(&exe.program().input_shapes, 7);
        let output = exe.evaluate(&inputs, &RunContext::new(7))?;

        let lhs: Array2<f32> = inputs[0].clone().into_dimensionality::<Ix2>()?;
        let rhs: Array2<f32> = inputs[1].clone().into_dimensionality::<Ix2>()?;
        let expected = lhs.dot(&rhs);
        let got = output.into_dimensionality::<Ix2>()?;
        for (a, b) in expected.iter().zip(got.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
        Ok(())
    }

    #[test]
    fn fused_elementwise_matches_unscheduled() -> anyhow::Result<()> {
        let baseline = FuncBuilder::new("add").elementwise(ElementwiseOp::Add, &[6, 4])?;
        let fused = ScheduleDesc::new(vec![ScheduleStep::Fuse {
            outer: "i".into(),
            inner: "j".into(),
        }])
        .replay(&baseline)?;

        let inputs = random_inputs(&[vec![6, 4], vec![6, 4]], 3);
        let ctx = RunContext::new(3);
        let reference = compile(&baseline).evaluate(&inputs, &ctx)?;
        let scheduled = compile(&fused).evaluate(&inputs, &ctx)?;
        assert_eq!(reference, scheduled);
        let at = IxDyn(&[2, 3]);
        assert_eq!(reference[&at], inputs[0][&at] + inputs[1][&at]);
        Ok(())
    }

    #[test]
    fn reduce_sum_rows() -> anyhow::Result<()> {
        let func = FuncBuilder::new("sum").reduce_sum(&[4, 8])?;
        let inputs = random_inputs(&[vec![4, 8]], 11);
        let output = compile(&func).evaluate(&inputs, &RunContext::new(11))?;
        let expected = inputs[0].sum_axis(ndarray::Axis(1));
        for (a, b) in expected.iter().zip(output.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn expired_deadline_times_out() -> anyhow::Result<()> {
        let func = FuncBuilder::new("mm").matmul(64, 64, 64)?;
        let exe = compile(&func);
        let ctx = RunContext::new(0).with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(exe.run(&ctx), Err(RuntimeError::Timeout)));
        Ok(())
    }

    #[test]
    fn backend_rejects_gpu_targets() -> anyhow::Result<()> {
        let func = FuncBuilder::new("mm").matmul(4, 4, 4)?;
        let result = CpuBackend::new().compile(&func, &Target::gpu(4));
        assert!(matches!(result, Err(CompileError::UnsupportedTarget { .. })));
        Ok(())
    }

    #[test]
    fn run_captures_output_on_request() -> anyhow::Result<()> {
        let func = FuncBuilder::new("relu").elementwise(ElementwiseOp::Relu, &[16])?;
        let exe = CpuBackend::new().compile(&func, &Target::cpu(2))?;
        let plain = exe.run(&RunContext::new(1))?;
        assert!(plain.output.is_none());
        let captured = exe.run(&RunContext::new(1).capturing_output())?;
        let output = captured.output.expect("captured output");
        assert_eq!(output.len(), 16);
        assert!(output.iter().all(|&value| value >= 0.0));
        Ok(())
    }
}
