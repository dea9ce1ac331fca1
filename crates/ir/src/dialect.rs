//! Tensor computations and loop-nest definitions.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_type(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        }
    }

    pub fn element_size_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorSpec {
    pub fn new<N: Into<String>>(name: N, shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.num_elements() * self.dtype.element_size_bytes()
    }

    pub fn type_string(&self) -> String {
        let dims = self
            .shape
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}[{}]", self.dtype.element_type(), dims)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ElementwiseOp {
    Add,
    Mul,
    Relu,
}

impl ElementwiseOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementwiseOp::Add => "add",
            ElementwiseOp::Mul => "mul",
            ElementwiseOp::Relu => "relu",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            ElementwiseOp::Add | ElementwiseOp::Mul => 2,
            ElementwiseOp::Relu => 1,
        }
    }

    pub fn apply(&self, args: &[f32]) -> f32 {
        match self {
            ElementwiseOp::Add => args[0] + args[1],
            ElementwiseOp::Mul => args[0] * args[1],
            ElementwiseOp::Relu => args[0].max(0.0),
        }
    }
}

/// The unscheduled computation a function performs.
///
/// Every variant accumulates into a zero-initialized output, so the
/// statement can be evaluated once per point of the iteration space in any
/// loop order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ComputeDef {
    /// `out[i, j] += lhs[i, k] * rhs[k, j]`
    Matmul {
        lhs: TensorSpec,
        rhs: TensorSpec,
        out: TensorSpec,
    },
    /// `out[idx] = op(inputs[idx]...)` over every output index.
    Elementwise {
        op: ElementwiseOp,
        inputs: Vec<TensorSpec>,
        out: TensorSpec,
    },
    /// `out[..., i] += input[..., i, r]`, reducing the last input dimension.
    ReduceSum { input: TensorSpec, out: TensorSpec },
}

impl ComputeDef {
    pub fn kind(&self) -> &'static str {
        match self {
            ComputeDef::Matmul { .. } => "matmul",
            ComputeDef::Elementwise { op, .. } => op.as_str(),
            ComputeDef::ReduceSum { .. } => "reduce_sum",
        }
    }

    pub fn inputs(&self) -> Vec<&TensorSpec> {
        match self {
            ComputeDef::Matmul { lhs, rhs, .. } => vec![lhs, rhs],
            ComputeDef::Elementwise { inputs, .. } => inputs.iter().collect(),
            ComputeDef::ReduceSum { input, .. } => vec![input],
        }
    }

    pub fn output(&self) -> &TensorSpec {
        match self {
            ComputeDef::Matmul { out, .. } => out,
            ComputeDef::Elementwise { out, .. } => out,
            ComputeDef::ReduceSum { out, .. } => out,
        }
    }

    /// Arithmetic operations per point of the iteration space.
    pub fn flops_per_point(&self) -> f64 {
        match self {
            ComputeDef::Matmul { .. } => 2.0,
            ComputeDef::Elementwise { .. } => 1.0,
            ComputeDef::ReduceSum { .. } => 1.0,
        }
    }

    /// Check operand shapes agree with each other.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ComputeDef::Matmul { lhs, rhs, out } => {
                if lhs.shape.len() != 2 || rhs.shape.len() != 2 || out.shape.len() != 2 {
                    return Err("matmul operands must be rank 2".into());
                }
                if lhs.shape[1] != rhs.shape[0] {
                    return Err(format!(
                        "matmul reduction mismatch: lhs {:?} vs rhs {:?}",
                        lhs.shape, rhs.shape
                    ));
                }
                if out.shape != [lhs.shape[0], rhs.shape[1]] {
                    return Err(format!("matmul output shape {:?} is wrong", out.shape));
                }
            }
            ComputeDef::Elementwise { op, inputs, out } => {
                if inputs.len() != op.arity() {
                    return Err(format!(
                        "{} expects {} inputs, got {}",
                        op.as_str(),
                        op.arity(),
                        inputs.len()
                    ));
                }
                if out.shape.is_empty() {
                    return Err("elementwise output must have at least one dimension".into());
                }
                if let Some(bad) = inputs.iter().find(|input| input.shape != out.shape) {
                    return Err(format!(
                        "elementwise input {} has shape {:?}, expected {:?}",
                        bad.name, bad.shape, out.shape
                    ));
                }
            }
            ComputeDef::ReduceSum { input, out } => {
                let Some((_, kept)) = input.shape.split_last() else {
                    return Err("reduction input must have at least one dimension".into());
                };
                let expected = if kept.is_empty() { vec![1] } else { kept.to_vec() };
                if out.shape != expected {
                    return Err(format!(
                        "reduction output shape {:?}, expected {:?}",
                        out.shape, expected
                    ));
                }
            }
        }
        let all_dims = self
            .inputs()
            .into_iter()
            .chain(std::iter::once(self.output()))
            .flat_map(|tensor| tensor.shape.iter());
        if all_dims.into_iter().any(|&dim| dim == 0) {
            return Err("tensor dimensions must be > 0".into());
        }
        Ok(())
    }

    /// Iteration axes of the computation, spatial axes first.
    pub fn axes(&self) -> Vec<Axis> {
        match self {
            ComputeDef::Matmul { lhs, rhs, .. } => vec![
                Axis::spatial("i", lhs.shape[0]),
                Axis::spatial("j", rhs.shape[1]),
                Axis::reduce("k", lhs.shape[1]),
            ],
            ComputeDef::Elementwise { out, .. } => out
                .shape
                .iter()
                .enumerate()
                .map(|(dim, &extent)| Axis::spatial(spatial_axis_name(dim), extent))
                .collect(),
            ComputeDef::ReduceSum { input, .. } => {
                let (&reduced, kept) = match input.shape.split_last() {
                    Some(split) => split,
                    None => return Vec::new(),
                };
                let mut axes: Vec<Axis> = kept
                    .iter()
                    .enumerate()
                    .map(|(dim, &extent)| Axis::spatial(spatial_axis_name(dim), extent))
                    .collect();
                axes.push(Axis::reduce("r", reduced));
                axes
            }
        }
    }
}

fn spatial_axis_name(dim: usize) -> String {
    const NAMES: [&str; 6] = ["i", "j", "l", "m", "n", "p"];
    NAMES
        .get(dim)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("d{}", dim))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AxisKind {
    Spatial,
    Reduce,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Axis {
    pub name: String,
    pub extent: usize,
    pub kind: AxisKind,
}

impl Axis {
    pub fn spatial<N: Into<String>>(name: N, extent: usize) -> Self {
        Self {
            name: name.into(),
            extent,
            kind: AxisKind::Spatial,
        }
    }

    pub fn reduce<N: Into<String>>(name: N, extent: usize) -> Self {
        Self {
            name: name.into(),
            extent,
            kind: AxisKind::Reduce,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum LoopAnnotation {
    #[default]
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
}

impl LoopAnnotation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopAnnotation::Serial => "serial",
            LoopAnnotation::Parallel => "parallel",
            LoopAnnotation::Vectorized => "vectorized",
            LoopAnnotation::Unrolled => "unrolled",
        }
    }
}

/// A slice of one original axis iterated by a loop.
///
/// The loop variable's contribution to the axis index is `value * stride`
/// where `value` ranges over `0..extent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AxisPart {
    pub axis: usize,
    pub stride: usize,
    pub extent: usize,
}

/// One loop of a scheduled nest.
///
/// A loop produced by fusion iterates several parts, outermost first; its
/// value is decomposed in mixed radix, innermost part fastest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Loop {
    pub name: String,
    pub parts: Vec<AxisPart>,
    pub annotation: LoopAnnotation,
}

impl Loop {
    pub fn over_axis(index: usize, axis: &Axis) -> Self {
        Self {
            name: axis.name.clone(),
            parts: vec![AxisPart {
                axis: index,
                stride: 1,
                extent: axis.extent,
            }],
            annotation: LoopAnnotation::Serial,
        }
    }

    pub fn extent(&self) -> usize {
        self.parts.iter().map(|part| part.extent).product()
    }

    pub fn is_fused(&self) -> bool {
        self.parts.len() > 1
    }

    /// Whether every part of this loop iterates a reduction axis.
    pub fn is_reduction(&self, axes: &[Axis]) -> bool {
        self.parts
            .iter()
            .all(|part| matches!(axes.get(part.axis), Some(axis) if axis.kind == AxisKind::Reduce))
    }

    pub fn touches_reduction(&self, axes: &[Axis]) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(axes.get(part.axis), Some(axis) if axis.kind == AxisKind::Reduce))
    }

    /// Add this loop's contribution for `value` into `indices`.
    pub fn accumulate_indices(&self, mut value: usize, indices: &mut [usize]) {
        for part in self.parts.iter().rev() {
            indices[part.axis] += (value % part.extent) * part.stride;
            value /= part.extent;
        }
    }
}
