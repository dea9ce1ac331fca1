//! Lowering a schedule description into a checked, target-legal function.

use crate::builder::LoweredFunc;
use crate::dialect::LoopAnnotation;
use crate::passes::ScheduleDesc;
use crate::target::{Arch, Target};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoweringError {
    #[error("invalid compute definition: {0}")]
    InvalidCompute(String),
    #[error("unknown loop `{0}`")]
    UnknownLoop(String),
    #[error("loop `{lp}` cannot be split by {factor}")]
    InvalidFactor { lp: String, factor: usize },
    #[error("loop `{lp}` of extent {extent} is not divisible by {factor}")]
    NotDivisible {
        lp: String,
        extent: usize,
        factor: usize,
    },
    #[error("loop `{0}` is fused and cannot be split")]
    CannotSplitFused(String),
    #[error("loop `{0}` is already annotated")]
    AlreadyAnnotated(String),
    #[error("loops `{outer}` and `{inner}` are not adjacent")]
    NotAdjacent { outer: String, inner: String },
    #[error("cannot reorder loop `{0}` with itself")]
    InvalidReorder(String),
    #[error("cannot fuse spatial and reduction loops `{outer}` and `{inner}`")]
    MixedAxisKinds { outer: String, inner: String },
    #[error("illegal {annotation} loop `{lp}`: {reason}")]
    IllegalAnnotation {
        lp: String,
        annotation: &'static str,
        reason: String,
    },
    #[error("malformed loop nest: {0}")]
    Malformed(String),
}

/// Lowering collaborator: materializes a schedule for a target.
///
/// Implementations must never mutate `baseline`; they work on a copy.
pub trait Lowerer: Send + Sync {
    fn name(&self) -> &str;

    fn lower(
        &self,
        baseline: &LoweredFunc,
        schedule: &ScheduleDesc,
        target: &Target,
    ) -> Result<LoweredFunc, LoweringError>;
}

/// Replays the schedule primitives and enforces target legality rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScheduleLowerer;

impl ScheduleLowerer {
    pub fn new() -> Self {
        Self
    }

    /// Target-dependent legality of an already transformed nest.
    pub fn check(&self, func: &LoweredFunc, target: &Target) -> Result<(), LoweringError> {
        func.verify()?;

        let innermost = func.loops.len().saturating_sub(1);
        let last_plain = func
            .loops
            .iter()
            .rposition(|lp| {
                matches!(
                    lp.annotation,
                    LoopAnnotation::Serial | LoopAnnotation::Parallel
                )
            });
        let mut unroll_product = 1usize;
        let mut parallel_positions = Vec::new();

        for (position, lp) in func.loops.iter().enumerate() {
            let illegal = |reason: String| LoweringError::IllegalAnnotation {
                lp: lp.name.clone(),
                annotation: lp.annotation.as_str(),
                reason,
            };
            match lp.annotation {
                LoopAnnotation::Serial => {}
                LoopAnnotation::Vectorized => {
                    let extent = lp.extent();
                    if position != innermost {
                        return Err(illegal("only the innermost loop can be vectorized".into()));
                    }
                    if lp.touches_reduction(&func.axes) {
                        return Err(illegal("reduction loops cannot be vectorized".into()));
                    }
                    if !extent.is_power_of_two() || extent > target.max_vector_width {
                        return Err(illegal(format!(
                            "width {} is not a power of two <= {}",
                            extent, target.max_vector_width
                        )));
                    }
                }
                LoopAnnotation::Unrolled => {
                    if last_plain.is_some_and(|last| position < last) {
                        return Err(illegal("unrolled loops must be innermost".into()));
                    }
                    unroll_product = unroll_product.saturating_mul(lp.extent());
                }
                LoopAnnotation::Parallel => {
                    if lp.touches_reduction(&func.axes) {
                        return Err(illegal("reduction loops cannot run in parallel".into()));
                    }
                    parallel_positions.push(position);
                }
            }
        }

        if unroll_product > target.max_unroll {
            return Err(LoweringError::IllegalAnnotation {
                lp: func.name.clone(),
                annotation: LoopAnnotation::Unrolled.as_str(),
                reason: format!(
                    "unrolled extent {} exceeds {}",
                    unroll_product, target.max_unroll
                ),
            });
        }

        let prefix = parallel_positions
            .iter()
            .enumerate()
            .all(|(index, &position)| index == position);
        let max_parallel = match target.arch {
            Arch::Cpu => 1,
            Arch::Gpu => 3,
        };
        if !prefix || parallel_positions.len() > max_parallel {
            let name = parallel_positions
                .last()
                .map(|&position| func.loops[position].name.clone())
                .unwrap_or_default();
            return Err(LoweringError::IllegalAnnotation {
                lp: name,
                annotation: LoopAnnotation::Parallel.as_str(),
                reason: format!(
                    "{} targets allow at most {} outermost parallel loop(s)",
                    target.arch, max_parallel
                ),
            });
        }
        Ok(())
    }
}

impl Lowerer for ScheduleLowerer {
    fn name(&self) -> &str {
        "schedule-replay"
    }

    fn lower(
        &self,
        baseline: &LoweredFunc,
        schedule: &ScheduleDesc,
        target: &Target,
    ) -> Result<LoweredFunc, LoweringError> {
        let func = schedule.replay(baseline)?;
        self.check(&func, target)?;
        debug!(
            func = %func.name,
            steps = schedule.len(),
            loops = func.loops.len(),
            "lowered schedule"
        );
        Ok(func)
    }
}
