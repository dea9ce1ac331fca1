//! GPU backend for SchedForge.
//!
//! The device is simulated: kernels are mapped onto a launch grid and timed
//! with an occupancy model instead of being dispatched to hardware.

pub mod planner;
pub mod runtime;

pub use planner::*;
pub use runtime::*;
