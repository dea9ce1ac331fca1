//! Schedule mutation and crossover.
//!
//! The mutator only knows structural legality: which primitives apply to the
//! current loop nest. Target rules (vector widths, parallel loop limits) are
//! enforced later by lowering, which drops candidates that break them.

use fastrand::Rng;
use schedforge_autotune::{SearchState, TuneTask};
use schedforge_ir::{Loop, LoopAnnotation, LoweredFunc, ScheduleDesc, ScheduleStep, Target};

/// Cut points tried before a crossover gives up.
const CROSSOVER_ATTEMPTS: usize = 4;

const LANE_CHOICES: [usize; 4] = [2, 4, 8, 16];

#[derive(Debug, Clone)]
pub struct ScheduleMutator {
    vector_widths: Vec<usize>,
    unroll_factors: Vec<usize>,
}

impl Default for ScheduleMutator {
    fn default() -> Self {
        Self {
            vector_widths: LANE_CHOICES.to_vec(),
            unroll_factors: LANE_CHOICES.to_vec(),
        }
    }
}

impl ScheduleMutator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip vector widths and unroll factors the target can never accept.
    pub fn for_target(target: &Target) -> Self {
        Self {
            vector_widths: LANE_CHOICES
                .into_iter()
                .filter(|&width| width <= target.max_vector_width)
                .collect(),
            unroll_factors: LANE_CHOICES
                .into_iter()
                .filter(|&factor| factor <= target.max_unroll)
                .collect(),
        }
    }

    /// Every primitive that applies cleanly to `func`.
    pub fn legal_steps(&self, func: &LoweredFunc) -> Vec<ScheduleStep> {
        let serial = |lp: &Loop| lp.annotation == LoopAnnotation::Serial;
        let mut steps = Vec::new();

        for lp in func.loops.iter().filter(|&lp| serial(lp) && !lp.is_fused()) {
            let extent = lp.extent();
            steps.extend(
                (2..extent)
                    .filter(|factor| extent % factor == 0)
                    .map(|factor| ScheduleStep::Split {
                        lp: lp.name.clone(),
                        factor,
                    }),
            );
        }

        for pair in func.loops.windows(2) {
            let (outer, inner) = (&pair[0], &pair[1]);
            steps.push(ScheduleStep::Reorder {
                first: outer.name.clone(),
                second: inner.name.clone(),
            });
            if serial(outer)
                && serial(inner)
                && outer.touches_reduction(&func.axes) == inner.touches_reduction(&func.axes)
            {
                steps.push(ScheduleStep::Fuse {
                    outer: outer.name.clone(),
                    inner: inner.name.clone(),
                });
            }
        }

        if let Some(inner) = func.loops.last().filter(|&lp| serial(lp)) {
            let extent = inner.extent();
            let fits = |lanes: usize| {
                lanes == extent || (!inner.is_fused() && lanes < extent && extent % lanes == 0)
            };
            if !inner.touches_reduction(&func.axes) {
                for &width in self.vector_widths.iter().filter(|&&width| fits(width)) {
                    steps.push(ScheduleStep::Vectorize {
                        lp: inner.name.clone(),
                        width,
                    });
                }
            }
            for &factor in self.unroll_factors.iter().filter(|&&factor| fits(factor)) {
                steps.push(ScheduleStep::Unroll {
                    lp: inner.name.clone(),
                    factor,
                });
            }
        }

        // the outermost loop not yet in the parallel band
        if let Some(lp) = func
            .loops
            .iter()
            .find(|lp| lp.annotation != LoopAnnotation::Parallel)
        {
            if serial(lp) && !lp.touches_reduction(&func.axes) {
                steps.push(ScheduleStep::Parallel {
                    lp: lp.name.clone(),
                });
            }
        }

        steps
    }

    pub fn random_step(&self, func: &LoweredFunc, rng: &mut Rng) -> Option<ScheduleStep> {
        let mut steps = self.legal_steps(func);
        if steps.is_empty() {
            return None;
        }
        let index = rng.usize(..steps.len());
        Some(steps.swap_remove(index))
    }

    /// Apply one random legal primitive to `parent`.
    pub fn mutate(
        &self,
        parent: &SearchState,
        rng: &mut Rng,
        sequence: u64,
    ) -> Option<SearchState> {
        let step = self.random_step(parent.func(), rng)?;
        let mut func = parent.func().clone();
        step.apply(&mut func).ok()?;
        Some(SearchState::new(
            parent.schedule().with_step(step),
            func,
            sequence,
        ))
    }

    /// Replay a prefix of `first` followed by a suffix of `second`.
    pub fn crossover(
        &self,
        task: &TuneTask,
        first: &SearchState,
        second: &SearchState,
        rng: &mut Rng,
        sequence: u64,
    ) -> Option<SearchState> {
        let (a, b) = (&first.schedule().steps, &second.schedule().steps);
        for _ in 0..CROSSOVER_ATTEMPTS {
            let cut_a = rng.usize(..=a.len());
            let cut_b = rng.usize(..=b.len());
            let steps: Vec<ScheduleStep> =
                a[..cut_a].iter().chain(&b[cut_b..]).cloned().collect();
            if let Ok(child) = SearchState::from_schedule(task, ScheduleDesc::new(steps), sequence)
            {
                return Some(child);
            }
        }
        None
    }

    /// Up to `depth` random mutations of the baseline.
    pub fn random_walk(
        &self,
        task: &TuneTask,
        depth: usize,
        rng: &mut Rng,
        sequence: u64,
    ) -> Option<SearchState> {
        let mut state = task.baseline_state();
        let mut applied = 0;
        for _ in 0..depth {
            match self.mutate(&state, rng, sequence) {
                Some(next) => {
                    state = next;
                    applied += 1;
                }
                None => break,
            }
        }
        (applied > 0).then_some(state)
    }
}
