//! Planning a loop nest into an executable CPU loop program.

use schedforge_ir::{CompileError, ComputeDef, ElementwiseOp, LoopAnnotation, LoweredFunc};

/// Deepest loop nest the CPU code generator accepts.
pub const MAX_LOOP_DEPTH: usize = 16;

/// Largest per-loop offset table the planner materializes.
const MAX_TABLE_ENTRIES: usize = 1 << 22;

/// The statement executed at every point of the iteration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    /// `out += in0 * in1`
    MulAccumulate,
    /// `out += op(in...)`
    Elementwise(ElementwiseOp),
    /// `out += in0`
    Accumulate,
}

/// Per-loop flat offsets for each operand.
///
/// `offsets[v * operands + t]` is the offset loop value `v` adds to operand
/// `t`, where operand `0` is the output and `1..` are the inputs.
#[derive(Debug, Clone)]
pub struct LoopPlan {
    pub name: String,
    pub extent: usize,
    pub annotation: LoopAnnotation,
    pub offsets: Vec<usize>,
}

/// A lowered function compiled for the host CPU.
#[derive(Debug, Clone)]
pub struct CpuProgram {
    pub name: String,
    pub statement: Statement,
    pub loops: Vec<LoopPlan>,
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shape: Vec<usize>,
    /// Operands per loop offset row: output plus inputs.
    pub operands: usize,
    /// The outermost loop runs on the rayon pool.
    pub parallel_outer: bool,
}

impl CpuProgram {
    pub fn output_len(&self) -> usize {
        self.output_shape.iter().product()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuPlanner;

impl CpuPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, func: &LoweredFunc) -> Result<CpuProgram, CompileError> {
        func.verify()
            .map_err(|err| CompileError::Codegen(err.to_string()))?;
        if func.loops.len() > MAX_LOOP_DEPTH {
            return Err(CompileError::Codegen(format!(
                "loop nest depth {} exceeds {}",
                func.loops.len(),
                MAX_LOOP_DEPTH
            )));
        }
        if let Some(position) = func
            .loops
            .iter()
            .position(|lp| lp.annotation == LoopAnnotation::Parallel)
        {
            if position != 0 {
                return Err(CompileError::Codegen(format!(
                    "parallel loop `{}` is not outermost",
                    func.loops[position].name
                )));
            }
        }

        let (statement, coefficients) = operand_coefficients(func);
        let operands = coefficients.len();

        let mut loops = Vec::with_capacity(func.loops.len());
        for lp in &func.loops {
            let extent = lp.extent();
            if extent.saturating_mul(operands) > MAX_TABLE_ENTRIES {
                return Err(CompileError::Resources(format!(
                    "loop `{}` of extent {} is too large to plan",
                    lp.name, extent
                )));
            }
            let mut offsets = vec![0usize; extent * operands];
            let mut indices = vec![0usize; func.axes.len()];
            for value in 0..extent {
                indices.iter_mut().for_each(|index| *index = 0);
                lp.accumulate_indices(value, &mut indices);
                for (operand, coeffs) in coefficients.iter().enumerate() {
                    offsets[value * operands + operand] = indices
                        .iter()
                        .zip(coeffs)
                        .map(|(index, coeff)| index * coeff)
                        .sum();
                }
            }
            loops.push(LoopPlan {
                name: lp.name.clone(),
                extent,
                annotation: lp.annotation,
                offsets,
            });
        }

        let parallel_outer = loops
            .first()
            .is_some_and(|lp| lp.annotation == LoopAnnotation::Parallel);

        Ok(CpuProgram {
            name: func.name.clone(),
            statement,
            loops,
            input_shapes: func
                .compute
                .inputs()
                .iter()
                .map(|tensor| tensor.shape.clone())
                .collect(),
            output_shape: func.compute.output().shape.clone(),
            operands,
            parallel_outer,
        })
    }
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1];
    }
    strides
}

/// Flat-offset coefficient per axis for the output followed by each input.
fn operand_coefficients(func: &LoweredFunc) -> (Statement, Vec<Vec<usize>>) {
    let axes = func.axes.len();
    match &func.compute {
        ComputeDef::Matmul { rhs, .. } => {
            let k = func.axes[2].extent;
            let n = rhs.shape[1];
            // axes: i, j, k
            let out = vec![n, 1, 0];
            let lhs = vec![k, 0, 1];
            let rhs = vec![0, 1, n];
            (Statement::MulAccumulate, vec![out, lhs, rhs])
        }
        ComputeDef::Elementwise { op, inputs, out } => {
            let strides = row_major_strides(&out.shape);
            let mut coefficients = vec![strides.clone()];
            coefficients.extend(inputs.iter().map(|_| strides.clone()));
            (Statement::Elementwise(*op), coefficients)
        }
        ComputeDef::ReduceSum { input, .. } => {
            let input_strides = row_major_strides(&input.shape);
            let kept = &input.shape[..input.shape.len() - 1];
            let mut out = row_major_strides(kept);
            out.resize(axes, 0);
            (Statement::Accumulate, vec![out, input_strides])
        }
    }
}
