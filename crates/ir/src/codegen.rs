//! Code generation and execution interfaces implemented by backends.

use crate::builder::LoweredFunc;
use crate::target::{Arch, Target};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("backend `{backend}` does not support {arch} targets")]
    UnsupportedTarget { backend: String, arch: Arch },
    #[error("cannot generate code: {0}")]
    Codegen(String),
    #[error("kernel exceeds device resources: {0}")]
    Resources(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("execution exceeded its deadline")]
    Timeout,
    #[error("execution was cancelled")]
    Cancelled,
    #[error("execution crashed: {0}")]
    Crashed(String),
}

/// Shared flag used to ask a running execution to stop early.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-run parameters handed to an [`Executable`].
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Seed for the synthetic input tensors.
    pub seed: u64,
    pub deadline: Option<Instant>,
    pub cancel: CancelFlag,
    /// Return the output tensor so callers can compare results.
    pub capture_output: bool,
}

impl RunContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            deadline: None,
            cancel: CancelFlag::new(),
            capture_output: false,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn capturing_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Cooperative check for long-running executions.
    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(RuntimeError::Timeout);
        }
        Ok(())
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub elapsed: Duration,
    pub output: Option<Vec<f32>>,
}

/// A compiled artifact that can be executed repeatedly.
pub trait Executable: Send + Sync {
    fn run(&self, ctx: &RunContext) -> Result<Execution, RuntimeError>;
}

pub type DynExecutable = Arc<dyn Executable>;

/// Code generation collaborator for one architecture.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn arch(&self) -> Arch;
    fn compile(&self, func: &LoweredFunc, target: &Target) -> Result<DynExecutable, CompileError>;
}

pub type DynBackend = Arc<dyn Backend>;

/// Backends indexed by the architecture they generate code for.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: Vec<DynBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    pub fn register<B>(&mut self, backend: B)
    where
        B: Backend + 'static,
    {
        self.backends.push(Arc::new(backend));
    }

    pub fn with_backend<B>(mut self, backend: B) -> Self
    where
        B: Backend + 'static,
    {
        self.register(backend);
        self
    }

    pub fn backends(&self) -> &[DynBackend] {
        &self.backends
    }

    /// The most recently registered backend for `arch`.
    pub fn find(&self, arch: Arch) -> Option<DynBackend> {
        self.backends
            .iter()
            .rev()
            .find(|backend| backend.arch() == arch)
            .map(Arc::clone)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|backend| backend.name()))
            .finish()
    }
}
