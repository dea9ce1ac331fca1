//! SchedForge intermediate representation and collaborator interfaces.

pub mod builder;
pub mod codegen;
pub mod dialect;
pub mod lowering;
pub mod passes;
pub mod target;

pub use builder::*;
pub use codegen::*;
pub use dialect::*;
pub use lowering::*;
pub use passes::*;
pub use target::*;
