//! Schedule primitives that rewrite a function's loop nest.
//!
//! A schedule is an ordered list of [`ScheduleStep`]s. Each step names the
//! loops it touches, so a schedule can be replayed on a fresh copy of the
//! baseline function, which is how candidates are reconstructed from the
//! database and recombined during search.

use crate::builder::LoweredFunc;
use crate::dialect::{AxisPart, Loop, LoopAnnotation};
use crate::lowering::LoweringError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "primitive", rename_all = "snake_case")]
pub enum ScheduleStep {
    /// Split `lp` into `lp.o` (extent / factor) and `lp.i` (factor).
    Split { lp: String, factor: usize },
    /// Split two adjacent loops and interleave the pieces as `outer.o, inner.o, outer.i, inner.i`.
    Tile {
        outer: String,
        inner: String,
        outer_factor: usize,
        inner_factor: usize,
    },
    /// Swap the positions of two loops.
    Reorder { first: String, second: String },
    /// Merge `outer` and the loop directly inside it into one loop.
    Fuse { outer: String, inner: String },
    /// Mark `lp` vectorized, splitting off an inner loop of `width` if needed.
    Vectorize { lp: String, width: usize },
    /// Mark `lp` unrolled, splitting off an inner loop of `factor` if needed.
    Unroll { lp: String, factor: usize },
    /// Mark `lp` parallel.
    Parallel { lp: String },
}

impl ScheduleStep {
    pub fn name(&self) -> &'static str {
        match self {
            ScheduleStep::Split { .. } => "split",
            ScheduleStep::Tile { .. } => "tile",
            ScheduleStep::Reorder { .. } => "reorder",
            ScheduleStep::Fuse { .. } => "fuse",
            ScheduleStep::Vectorize { .. } => "vectorize",
            ScheduleStep::Unroll { .. } => "unroll",
            ScheduleStep::Parallel { .. } => "parallel",
        }
    }

    pub fn apply(&self, func: &mut LoweredFunc) -> Result<(), LoweringError> {
        match self {
            ScheduleStep::Split { lp, factor } => split(func, lp, *factor).map(|_| ()),
            ScheduleStep::Tile {
                outer,
                inner,
                outer_factor,
                inner_factor,
            } => tile(func, outer, inner, *outer_factor, *inner_factor),
            ScheduleStep::Reorder { first, second } => reorder(func, first, second),
            ScheduleStep::Fuse { outer, inner } => fuse(func, outer, inner),
            ScheduleStep::Vectorize { lp, width } => {
                annotate_inner(func, lp, *width, LoopAnnotation::Vectorized)
            }
            ScheduleStep::Unroll { lp, factor } => {
                annotate_inner(func, lp, *factor, LoopAnnotation::Unrolled)
            }
            ScheduleStep::Parallel { lp } => {
                let position = position_of(func, lp)?;
                annotate(&mut func.loops[position], LoopAnnotation::Parallel)
            }
        }
    }
}

impl fmt::Display for ScheduleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleStep::Split { lp, factor } => write!(f, "split({}, {})", lp, factor),
            ScheduleStep::Tile {
                outer,
                inner,
                outer_factor,
                inner_factor,
            } => write!(
                f,
                "tile({}, {}, {}, {})",
                outer, inner, outer_factor, inner_factor
            ),
            ScheduleStep::Reorder { first, second } => write!(f, "reorder({}, {})", first, second),
            ScheduleStep::Fuse { outer, inner } => write!(f, "fuse({}, {})", outer, inner),
            ScheduleStep::Vectorize { lp, width } => write!(f, "vectorize({}, {})", lp, width),
            ScheduleStep::Unroll { lp, factor } => write!(f, "unroll({}, {})", lp, factor),
            ScheduleStep::Parallel { lp } => write!(f, "parallel({})", lp),
        }
    }
}

/// Serializable description of a schedule: the steps applied to the baseline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ScheduleDesc {
    pub steps: Vec<ScheduleStep>,
}

impl ScheduleDesc {
    pub fn new(steps: Vec<ScheduleStep>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn with_step(&self, step: ScheduleStep) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step);
        Self { steps }
    }

    /// Apply every step in order to `func`.
    pub fn apply(&self, func: &mut LoweredFunc) -> Result<(), LoweringError> {
        for step in &self.steps {
            step.apply(func)?;
            trace!(step = %step, loops = func.loops.len(), "applied schedule step");
        }
        Ok(())
    }

    /// Replay the schedule on a copy of `baseline`.
    pub fn replay(&self, baseline: &LoweredFunc) -> Result<LoweredFunc, LoweringError> {
        let mut func = baseline.clone();
        self.apply(&mut func)?;
        Ok(func)
    }
}

impl fmt::Display for ScheduleDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "<baseline>");
        }
        let rendered = self
            .steps
            .iter()
            .map(|step| step.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{}", rendered)
    }
}

fn position_of(func: &LoweredFunc, name: &str) -> Result<usize, LoweringError> {
    func.loop_position(name)
        .ok_or_else(|| LoweringError::UnknownLoop(name.to_string()))
}

fn annotate(lp: &mut Loop, annotation: LoopAnnotation) -> Result<(), LoweringError> {
    if lp.annotation != LoopAnnotation::Serial {
        return Err(LoweringError::AlreadyAnnotated(lp.name.clone()));
    }
    lp.annotation = annotation;
    Ok(())
}

/// Split a loop and return the position of the new inner loop.
fn split(func: &mut LoweredFunc, name: &str, factor: usize) -> Result<usize, LoweringError> {
    let position = position_of(func, name)?;
    let lp = &func.loops[position];
    if lp.is_fused() {
        return Err(LoweringError::CannotSplitFused(name.to_string()));
    }
    if lp.annotation != LoopAnnotation::Serial {
        return Err(LoweringError::AlreadyAnnotated(name.to_string()));
    }
    let part = lp.parts[0];
    if factor < 2 || factor >= part.extent {
        return Err(LoweringError::InvalidFactor {
            lp: name.to_string(),
            factor,
        });
    }
    if part.extent % factor != 0 {
        return Err(LoweringError::NotDivisible {
            lp: name.to_string(),
            extent: part.extent,
            factor,
        });
    }

    let outer = Loop {
        name: format!("{}.o", name),
        parts: vec![AxisPart {
            axis: part.axis,
            stride: part.stride * factor,
            extent: part.extent / factor,
        }],
        annotation: LoopAnnotation::Serial,
    };
    let inner = Loop {
        name: format!("{}.i", name),
        parts: vec![AxisPart {
            axis: part.axis,
            stride: part.stride,
            extent: factor,
        }],
        annotation: LoopAnnotation::Serial,
    };
    func.loops.splice(position..=position, [outer, inner]);
    Ok(position + 1)
}

fn tile(
    func: &mut LoweredFunc,
    outer: &str,
    inner: &str,
    outer_factor: usize,
    inner_factor: usize,
) -> Result<(), LoweringError> {
    let outer_position = position_of(func, outer)?;
    let inner_position = position_of(func, inner)?;
    if inner_position != outer_position + 1 {
        return Err(LoweringError::NotAdjacent {
            outer: outer.to_string(),
            inner: inner.to_string(),
        });
    }
    split(func, outer, outer_factor)?;
    split(func, inner, inner_factor)?;
    // outer.o, outer.i, inner.o, inner.i -> outer.o, inner.o, outer.i, inner.i
    func.loops.swap(outer_position + 1, outer_position + 2);
    Ok(())
}

fn reorder(func: &mut LoweredFunc, first: &str, second: &str) -> Result<(), LoweringError> {
    let a = position_of(func, first)?;
    let b = position_of(func, second)?;
    if a == b {
        return Err(LoweringError::InvalidReorder(first.to_string()));
    }
    func.loops.swap(a, b);
    Ok(())
}

fn fuse(func: &mut LoweredFunc, outer: &str, inner: &str) -> Result<(), LoweringError> {
    let outer_position = position_of(func, outer)?;
    let inner_position = position_of(func, inner)?;
    if inner_position != outer_position + 1 {
        return Err(LoweringError::NotAdjacent {
            outer: outer.to_string(),
            inner: inner.to_string(),
        });
    }
    let outer_loop = &func.loops[outer_position];
    let inner_loop = &func.loops[inner_position];
    for lp in [outer_loop, inner_loop] {
        if lp.annotation != LoopAnnotation::Serial {
            return Err(LoweringError::AlreadyAnnotated(lp.name.clone()));
        }
    }
    if outer_loop.touches_reduction(&func.axes) != inner_loop.touches_reduction(&func.axes) {
        return Err(LoweringError::MixedAxisKinds {
            outer: outer.to_string(),
            inner: inner.to_string(),
        });
    }

    let mut parts = outer_loop.parts.clone();
    parts.extend(inner_loop.parts.iter().copied());
    let fused = Loop {
        name: format!("{}+{}", outer, inner),
        parts,
        annotation: LoopAnnotation::Serial,
    };
    func.loops
        .splice(outer_position..=inner_position, std::iter::once(fused));
    Ok(())
}

fn annotate_inner(
    func: &mut LoweredFunc,
    name: &str,
    lanes: usize,
    annotation: LoopAnnotation,
) -> Result<(), LoweringError> {
    let position = position_of(func, name)?;
    let extent = func.loops[position].extent();
    let target = if extent == lanes {
        position
    } else {
        split(func, name, lanes)?
    };
    annotate(&mut func.loops[target], annotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::dialect::ElementwiseOp;

    #[test]
    fn split_preserves_coverage() -> anyhow::Result<()> {
        let mut func = FuncBuilder::new("mm").matmul(16, 16, 8)?;
        ScheduleStep::Split {
            lp: "i".into(),
            factor: 4,
        }
        .apply(&mut func)?;
        func.verify()?;
        let names: Vec<&str> = func.loops.iter().map(|lp| lp.name.as_str()).collect();
        assert_eq!(names, ["i.o", "i.i", "j", "k"]);
        assert_eq!(func.loops[0].parts[0].stride, 4);
        Ok(())
    }

    #[test]
    fn split_rejects_non_divisible_factor() -> anyhow::Result<()> {
        let mut func = FuncBuilder::new("mm").matmul(12, 16, 8)?;
        let err = ScheduleStep::Split {
            lp: "i".into(),
            factor: 5,
        }
        .apply(&mut func)
        .unwrap_err();
        assert!(matches!(err, LoweringError::NotDivisible { .. }));
        Ok(())
    }

    #[test]
    fn tile_interleaves_pieces() -> anyhow::Result<()> {
        let schedule = ScheduleDesc::new(vec![ScheduleStep::Tile {
            outer: "i".into(),
            inner: "j".into(),
            outer_factor: 4,
            inner_factor: 8,
        }]);
        let baseline = FuncBuilder::new("mm").matmul(16, 32, 8)?;
        let func = schedule.replay(&baseline)?;
        func.verify()?;
        let names: Vec<&str> = func.loops.iter().map(|lp| lp.name.as_str()).collect();
        assert_eq!(names, ["i.o", "j.o", "i.i", "j.i", "k"]);
        // the baseline is untouched by replay
        assert_eq!(baseline.loops.len(), 3);
        Ok(())
    }

    #[test]
    fn fuse_rejects_spatial_with_reduction() -> anyhow::Result<()> {
        let mut func = FuncBuilder::new("mm").matmul(8, 8, 8)?;
        let err = ScheduleStep::Fuse {
            outer: "j".into(),
            inner: "k".into(),
        }
        .apply(&mut func)
        .unwrap_err();
        assert!(matches!(err, LoweringError::MixedAxisKinds { .. }));
        Ok(())
    }

    #[test]
    fn fuse_then_parallel_compose() -> anyhow::Result<()> {
        let schedule = ScheduleDesc::new(vec![
            ScheduleStep::Fuse {
                outer: "i".into(),
                inner: "j".into(),
            },
            ScheduleStep::Parallel { lp: "i+j".into() },
        ]);
        let baseline = FuncBuilder::new("add").elementwise(ElementwiseOp::Add, &[4, 16])?;
        let func = schedule.replay(&baseline)?;
        func.verify()?;
        assert_eq!(func.loops.len(), 1);
        assert_eq!(func.loops[0].annotation, LoopAnnotation::Parallel);
        assert_eq!(func.loops[0].extent(), 64);

        let mut fused = func.clone();
        let err = ScheduleStep::Split {
            lp: "i+j".into(),
            factor: 8,
        }
        .apply(&mut fused)
        .unwrap_err();
        assert!(matches!(err, LoweringError::CannotSplitFused(_)));
        Ok(())
    }

    #[test]
    fn vectorize_splits_when_width_is_smaller() -> anyhow::Result<()> {
        let mut func = FuncBuilder::new("relu").elementwise(ElementwiseOp::Relu, &[32])?;
        ScheduleStep::Vectorize {
            lp: "i".into(),
            width: 4,
        }
        .apply(&mut func)?;
        assert_eq!(func.loops.len(), 2);
        assert_eq!(func.loops[1].annotation, LoopAnnotation::Vectorized);
        assert_eq!(func.loops[1].extent(), 4);
        Ok(())
    }

    #[test]
    fn annotating_twice_fails() -> anyhow::Result<()> {
        let mut func = FuncBuilder::new("mm").matmul(8, 8, 8)?;
        let step = ScheduleStep::Parallel { lp: "i".into() };
        step.apply(&mut func)?;
        assert!(matches!(
            step.apply(&mut func),
            Err(LoweringError::AlreadyAnnotated(_))
        ));
        Ok(())
    }

    #[test]
    fn schedule_serializes_with_primitive_tags() -> anyhow::Result<()> {
        let schedule = ScheduleDesc::new(vec![ScheduleStep::Parallel { lp: "i".into() }]);
        let json = serde_json::to_string(&schedule)?;
        assert!(json.contains("\"primitive\":\"parallel\""));
        let parsed: ScheduleDesc = serde_json::from_str(&json)?;
        assert_eq!(parsed, schedule);
        Ok(())
    }
}
