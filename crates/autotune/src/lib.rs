//! Tuning tasks, cost model, schedule database and measurement.

pub mod cost_model;
pub mod database;
pub mod fingerprint;
pub mod measure;
pub mod state;
pub mod task;

pub use cost_model::*;
pub use database::*;
pub use fingerprint::*;
pub use measure::*;
pub use state::*;
pub use task::*;
