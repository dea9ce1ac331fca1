//! SchedForge facade: tuning sessions and materialization of tuned functions.

pub mod pipeline;
pub mod session;

pub use pipeline::*;
pub use session::*;

pub use schedforge_autotune as autotune;
pub use schedforge_ir as ir;
pub use schedforge_optimizer as optimizer;
