//! Schedule search and per-task tuning for SchedForge.
//!
//! A [`TaskOptimizer`] alternates cost-model guided search with real
//! measurements until a budget runs out or the search stops finding
//! anything that runs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │  EvolutionarySearch  │────▶│ ScheduleMeasurer │────▶│ CostModel       │
//! │  (mutate/crossover)  │     │ (lower, run)     │     │ Database        │
//! └──────────────────────┘     └──────────────────┘     └─────────────────┘
//!            ▲                                                   │
//!            └──────────────── predictions, seeds ───────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`options::TuningOptions`]: budgets and search parameters
//! - [`mutator::ScheduleMutator`]: legal schedule primitives, mutation, crossover
//! - [`search::EvolutionarySearch`]: proposes measurement candidates each round
//! - [`task_optimizer::TaskOptimizer`]: the search, measure, update loop
//! - [`report::OptimizedComputeExpr`]: the selected function and run statistics

pub mod mutator;
pub mod options;
pub mod report;
pub mod search;
pub mod task_optimizer;

pub use mutator::ScheduleMutator;
pub use options::TuningOptions;
pub use report::{OptimizedComputeExpr, StopReason, TuningStats};
pub use search::{EvolutionarySearch, SearchError};
pub use task_optimizer::{CancellationToken, TaskOptimizer, TunerPhase};
