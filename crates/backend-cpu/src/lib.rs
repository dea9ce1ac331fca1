//! Host CPU backend for SchedForge.

pub mod planner;
pub mod runtime;

pub use planner::*;
pub use runtime::*;
