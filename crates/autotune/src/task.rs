//! The unit of work being tuned.

use crate::fingerprint::fingerprint;
use crate::state::SearchState;
use schedforge_ir::{ComputeDef, LoweredFunc, LoweringError, Target};
use serde::Serialize;
use std::fmt;

/// Immutable description of one schedulable unit.
///
/// Shared as `Arc<TuneTask>` by every component of a tuning session.
#[derive(Debug, Clone)]
pub struct TuneTask {
    pub name: String,
    pub target: Target,
    /// The unscheduled function every schedule is replayed on.
    pub baseline: LoweredFunc,
    fingerprint: String,
}

#[derive(Serialize)]
struct TaskKey<'a> {
    compute: &'a ComputeDef,
    target: &'a Target,
}

impl TuneTask {
    pub fn new<N: Into<String>>(
        name: N,
        baseline: LoweredFunc,
        target: Target,
    ) -> Result<Self, LoweringError> {
        baseline.verify()?;
        let fingerprint = fingerprint(&TaskKey {
            compute: &baseline.compute,
            target: &target,
        });
        Ok(Self {
            name: name.into(),
            target,
            baseline,
            fingerprint,
        })
    }

    /// Database key: the computation's shape plus the target, independent of names.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn baseline_state(&self) -> SearchState {
        SearchState::baseline(self)
    }
}

impl fmt::Display for TuneTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} on {}, {})",
            self.name,
            self.baseline.compute.kind(),
            self.target,
            self.fingerprint
        )
    }
}
