//! Function construction and rendering.

use crate::dialect::{Axis, ComputeDef, DataType, ElementwiseOp, Loop, LoopAnnotation, TensorSpec};
use crate::lowering::LoweringError;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// A computation together with the loop nest that evaluates it.
///
/// An unscheduled function iterates its axes in definition order with one
/// serial loop per axis. Schedule primitives rewrite `loops` only; `compute`
/// and `axes` never change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LoweredFunc {
    pub name: String,
    pub compute: ComputeDef,
    pub axes: Vec<Axis>,
    pub loops: Vec<Loop>,
}

impl LoweredFunc {
    pub fn new<N: Into<String>>(name: N, compute: ComputeDef) -> Result<Self, LoweringError> {
        compute.validate().map_err(LoweringError::InvalidCompute)?;
        let axes = compute.axes();
        let loops = axes
            .iter()
            .enumerate()
            .map(|(index, axis)| Loop::over_axis(index, axis))
            .collect();
        Ok(Self {
            name: name.into(),
            compute,
            axes,
            loops,
        })
    }

    pub fn builder<N: Into<String>>(name: N) -> FuncBuilder {
        FuncBuilder::new(name)
    }

    pub fn loop_position(&self, name: &str) -> Option<usize> {
        self.loops.iter().position(|lp| lp.name == name)
    }

    pub fn find_loop(&self, name: &str) -> Option<&Loop> {
        self.loops.iter().find(|lp| lp.name == name)
    }

    /// Number of points in the iteration space.
    pub fn iteration_points(&self) -> usize {
        self.axes.iter().map(|axis| axis.extent).product()
    }

    pub fn total_flops(&self) -> f64 {
        self.iteration_points() as f64 * self.compute.flops_per_point()
    }

    /// Check that the loop nest covers every axis exactly once.
    ///
    /// For each axis the parts iterating it must form a mixed-radix
    /// decomposition: sorted by stride, every stride equals the product of
    /// the extents of the finer parts, and the product of all extents equals
    /// the axis extent.
    pub fn verify(&self) -> Result<(), LoweringError> {
        let mut per_axis: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.axes.len()];
        for lp in &self.loops {
            if lp.parts.is_empty() {
                return Err(LoweringError::Malformed(format!(
                    "loop {} iterates no axis",
                    lp.name
                )));
            }
            for part in &lp.parts {
                if part.extent == 0 || part.stride == 0 {
                    return Err(LoweringError::Malformed(format!(
                        "loop {} has a zero extent or stride",
                        lp.name
                    )));
                }
                let slots = per_axis.get_mut(part.axis).ok_or_else(|| {
                    LoweringError::Malformed(format!(
                        "loop {} references unknown axis {}",
                        lp.name, part.axis
                    ))
                })?;
                slots.push((part.stride, part.extent));
            }
        }

        for (axis, mut slots) in self.axes.iter().zip(per_axis) {
            slots.sort_unstable();
            let mut covered = 1usize;
            for (stride, extent) in slots {
                if stride != covered {
                    return Err(LoweringError::Malformed(format!(
                        "axis {} is not covered contiguously",
                        axis.name
                    )));
                }
                covered *= extent;
            }
            if covered != axis.extent {
                return Err(LoweringError::Malformed(format!(
                    "axis {} covers {} of {} iterations",
                    axis.name, covered, axis.extent
                )));
            }
        }

        let mut names: Vec<&str> = self.loops.iter().map(|lp| lp.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(LoweringError::Malformed("duplicate loop names".into()));
        }
        Ok(())
    }

    /// Render the nest as indented pseudo code.
    pub fn to_text(&self) -> String {
        let params = self
            .compute
            .inputs()
            .iter()
            .map(|tensor| format!("{}: {}", tensor.name, tensor.type_string()))
            .collect::<Vec<_>>()
            .join(", ");
        let out = self.compute.output();

        let mut text = String::new();
        let _ = writeln!(
            text,
            "func {}({}) -> {}: {} {{",
            self.name,
            params,
            out.name,
            out.type_string()
        );
        for (depth, lp) in self.loops.iter().enumerate() {
            let indent = "  ".repeat(depth + 1);
            let annotation = match lp.annotation {
                LoopAnnotation::Serial => String::new(),
                other => format!(" @{}", other.as_str()),
            };
            let _ = writeln!(
                text,
                "{}for {} in 0..{}{}",
                indent,
                lp.name,
                lp.extent(),
                annotation
            );
        }
        let indent = "  ".repeat(self.loops.len() + 1);
        let _ = writeln!(text, "{}{}", indent, self.statement_text());
        text.push_str("}\n");
        text
    }

    fn statement_text(&self) -> String {
        let names: Vec<&str> = self.axes.iter().map(|axis| axis.name.as_str()).collect();
        match &self.compute {
            ComputeDef::Matmul { lhs, rhs, out } => format!(
                "{}[{i}, {j}] += {}[{i}, {k}] * {}[{k}, {j}]",
                out.name,
                lhs.name,
                rhs.name,
                i = names[0],
                j = names[1],
                k = names[2]
            ),
            ComputeDef::Elementwise { op, inputs, out } => {
                let index = names.join(", ");
                let args = inputs
                    .iter()
                    .map(|input| format!("{}[{}]", input.name, index))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}[{}] = {}({})", out.name, index, op.as_str(), args)
            }
            ComputeDef::ReduceSum { input, out } => {
                let kept = &names[..names.len().saturating_sub(1)];
                let out_index = if kept.is_empty() {
                    "0".to_string()
                } else {
                    kept.join(", ")
                };
                format!(
                    "{}[{}] += {}[{}]",
                    out.name,
                    out_index,
                    input.name,
                    names.join(", ")
                )
            }
        }
    }
}

/// Convenience builder for the supported computations.
#[derive(Debug, Clone)]
pub struct FuncBuilder {
    name: String,
    dtype: DataType,
}

impl FuncBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            dtype: DataType::F32,
        }
    }

    pub fn dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn matmul(self, m: usize, n: usize, k: usize) -> Result<LoweredFunc, LoweringError> {
        let compute = ComputeDef::Matmul {
            lhs: tensor("lhs", &[m, k], self.dtype),
            rhs: tensor("rhs", &[k, n], self.dtype),
            out: tensor("out", &[m, n], self.dtype),
        };
        LoweredFunc::new(self.name, compute)
    }

    pub fn elementwise(
        self,
        op: ElementwiseOp,
        shape: &[usize],
    ) -> Result<LoweredFunc, LoweringError> {
        let inputs = (0..op.arity())
            .map(|index| tensor(&format!("in{}", index), shape, self.dtype))
            .collect();
        let compute = ComputeDef::Elementwise {
            op,
            inputs,
            out: tensor("out", shape, self.dtype),
        };
        LoweredFunc::new(self.name, compute)
    }

    pub fn reduce_sum(self, shape: &[usize]) -> Result<LoweredFunc, LoweringError> {
        let kept = match shape.split_last() {
            Some((_, kept)) if !kept.is_empty() => kept.to_vec(),
            _ => vec![1],
        };
        let compute = ComputeDef::ReduceSum {
            input: tensor("in", shape, self.dtype),
            out: tensor("out", &kept, self.dtype),
        };
        LoweredFunc::new(self.name, compute)
    }
}

pub fn tensor(name: &str, shape: &[usize], dtype: DataType) -> TensorSpec {
    TensorSpec::new(name, shape.to_vec(), dtype)
}
