//! Compiling and timing candidate schedules.

use crate::state::SearchState;
use crate::task::TuneTask;
use anyhow::{Context, Result};
use ndarray::{ArrayView1, Zip};
use rayon::prelude::*;
use schedforge_ir::{
    Arch, BackendRegistry, CancelFlag, CompileError, Executable, Lowerer, LoweringError,
    RunContext, RuntimeError, ScheduleDesc, Target,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Seed for the synthetic inputs of every run, so outputs are comparable.
const INPUT_SEED: u64 = 0x5eed;

/// Mean latency of the timed runs and the output of the last one.
type Timed = (Duration, Option<Vec<f32>>);

/// One candidate to measure and the task it belongs to.
#[derive(Debug, Clone)]
pub struct MeasureInput {
    pub task: Arc<TuneTask>,
    pub state: SearchState,
}

impl MeasureInput {
    pub fn new(task: Arc<TuneTask>, state: SearchState) -> Self {
        Self { task, state }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MeasureError {
    #[error("lowering failed: {0}")]
    Lowering(#[from] LoweringError),
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),
    #[error("execution failed: {0}")]
    Runtime(String),
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("output differs from the reference by {max_abs_diff}")]
    WrongAnswer { max_abs_diff: f64 },
}

impl MeasureError {
    /// Short label used in statistics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MeasureError::Lowering(_) => "lowering",
            MeasureError::Compile(_) => "compile",
            MeasureError::Runtime(_) => "runtime",
            MeasureError::Timeout(_) => "timeout",
            MeasureError::WrongAnswer { .. } => "wrong_answer",
        }
    }
}

impl From<RuntimeError> for MeasureError {
    fn from(err: RuntimeError) -> Self {
        MeasureError::Runtime(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeasureResult {
    Success { latency_ms: f64 },
    Failure(MeasureError),
}

impl MeasureResult {
    pub fn latency_ms(&self) -> Option<f64> {
        match self {
            MeasureResult::Success { latency_ms } => Some(*latency_ms),
            MeasureResult::Failure(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MeasureResult::Success { .. })
    }
}

/// Element-wise tolerance: `|got - want| <= abs + rel * |want|`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            abs: 1e-4,
            rel: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeasureOptions {
    pub warmup_runs: usize,
    /// Timed runs averaged into the reported latency.
    pub runs: usize,
    /// Budget for lowering, compiling and all runs of one candidate.
    pub timeout: Duration,
    /// Candidates measured concurrently.
    pub workers: usize,
    /// Compare each candidate's output with the unscheduled function's.
    pub reference: Option<Tolerance>,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            runs: 3,
            timeout: Duration::from_secs(10),
            workers: 1,
            reference: None,
        }
    }
}

impl MeasureOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.runs == 0 {
            return Err("runs must be > 0".into());
        }
        if self.workers == 0 {
            return Err("workers must be > 0".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be > 0".into());
        }
        if let Some(tolerance) = &self.reference {
            if tolerance.abs < 0.0 || tolerance.rel < 0.0 {
                return Err("reference tolerances must be >= 0".into());
            }
        }
        Ok(())
    }
}

/// Lowers, compiles and runs batches of candidates.
///
/// Candidates are isolated: a failure, panic or hang in one of them only
/// affects its own result.
pub struct ScheduleMeasurer {
    lowerer: Arc<dyn Lowerer>,
    backends: BackendRegistry,
    options: MeasureOptions,
    pool: rayon::ThreadPool,
    /// Baseline outputs by task fingerprint; `None` when none could be produced.
    references: Mutex<HashMap<String, Option<Arc<[f32]>>>>,
}

impl ScheduleMeasurer {
    pub fn new(
        lowerer: Arc<dyn Lowerer>,
        backends: BackendRegistry,
        options: MeasureOptions,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid measure options")?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|index| format!("schedforge-measure-{}", index))
            .build()
            .context("building measurement pool")?;
        Ok(Self {
            lowerer,
            backends,
            options,
            pool,
            references: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &MeasureOptions {
        &self.options
    }

    pub fn lowerer(&self) -> &Arc<dyn Lowerer> {
        &self.lowerer
    }

    /// Measure `inputs`; the i-th result belongs to the i-th input.
    pub fn measure(&self, inputs: &[MeasureInput]) -> Vec<MeasureResult> {
        let references = self.reference_outputs(inputs);
        self.pool.install(|| {
            inputs
                .par_iter()
                .map(|input| {
                    let reference = references
                        .get(input.task.fingerprint())
                        .and_then(|output| output.as_deref());
                    let result = self.measure_isolated(input, reference);
                    match &result {
                        MeasureResult::Success { latency_ms } => debug!(
                            task = %input.task.name,
                            state = input.state.fingerprint(),
                            latency_ms,
                            "measured candidate"
                        ),
                        MeasureResult::Failure(err) => debug!(
                            task = %input.task.name,
                            state = input.state.fingerprint(),
                            kind = err.kind(),
                            error = %err,
                            "candidate failed"
                        ),
                    }
                    result
                })
                .collect()
        })
    }

    /// Baseline outputs for the tasks of `inputs`, computed once per task.
    fn reference_outputs(&self, inputs: &[MeasureInput]) -> HashMap<String, Option<Arc<[f32]>>> {
        let mut batch = HashMap::new();
        if self.options.reference.is_none() {
            return batch;
        }
        for input in inputs {
            let task = &input.task;
            if batch.contains_key(task.fingerprint()) {
                continue;
            }
            let known = self
                .references
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(task.fingerprint())
                .cloned();
            let output = match known {
                Some(output) => output,
                None => {
                    let output = self.reference_output(task);
                    self.references
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(task.fingerprint().to_string(), output.clone());
                    output
                }
            };
            batch.insert(task.fingerprint().to_string(), output);
        }
        batch
    }

    /// Output of the unscheduled function on the task's backend, or on the
    /// host CPU when that backend produces no output.
    fn reference_output(&self, task: &Arc<TuneTask>) -> Option<Arc<[f32]>> {
        let mut targets = vec![task.target.clone()];
        if task.target.arch != Arch::Cpu {
            targets.push(Target::host());
        }
        for target in &targets {
            match self.run_schedule(task, &ScheduleDesc::default(), target, 0, 1, true) {
                Ok((_, Some(output))) => return Some(output.into()),
                Ok((_, None)) => debug!(
                    task = %task.name,
                    target = %target,
                    "backend produced no reference output"
                ),
                Err(err) => debug!(
                    task = %task.name,
                    target = %target,
                    error = %err,
                    "reference run failed"
                ),
            }
        }
        warn!(
            task = %task.name,
            "no reference output available; candidates are measured unchecked"
        );
        None
    }

    fn measure_isolated(&self, input: &MeasureInput, reference: Option<&[f32]>) -> MeasureResult {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.measure_one(input, reference)));
        match outcome {
            Ok(Ok(latency_ms)) => MeasureResult::Success { latency_ms },
            Ok(Err(err)) => MeasureResult::Failure(err),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(task = %input.task.name, panic = %message, "candidate panicked");
                MeasureResult::Failure(MeasureError::Runtime(format!("panicked: {}", message)))
            }
        }
    }

    fn measure_one(&self, input: &MeasureInput, reference: Option<&[f32]>) -> Result<f64, MeasureError> {
        let check = self.options.reference.zip(reference);
        let (elapsed, output) = self.run_schedule(
            &input.task,
            input.state.schedule(),
            &input.task.target,
            self.options.warmup_runs,
            self.options.runs,
            check.is_some(),
        )?;
        if let Some((tolerance, expected)) = check {
            match output {
                Some(got) => {
                    compare_outputs(&got, expected, tolerance)?;
                }
                None => debug!(
                    task = %input.task.name,
                    state = input.state.fingerprint(),
                    "backend produced no output; correctness not checked"
                ),
            }
        }
        Ok(elapsed.as_secs_f64() * 1e3)
    }

    /// Lower, compile and run `schedule` on a watched thread.
    ///
    /// The timeout covers lowering, compilation and every run. On timeout the
    /// cancellation flag is raised and the measuring worker moves on at once.
    /// An executable that never checks its [`RunContext`] keeps its detached
    /// `schedforge-run` thread busy until it returns on its own.
    fn run_schedule(
        &self,
        task: &Arc<TuneTask>,
        schedule: &ScheduleDesc,
        target: &Target,
        warmup_runs: usize,
        runs: usize,
        capture_output: bool,
    ) -> Result<Timed, MeasureError> {
        let backend = self.backends.find(target.arch).ok_or_else(|| {
            MeasureError::Compile(CompileError::UnsupportedTarget {
                backend: "<none registered>".into(),
                arch: target.arch,
            })
        })?;
        let timeout = self.options.timeout;
        let cancel = CancelFlag::new();
        let mut ctx = RunContext::new(INPUT_SEED)
            .with_deadline(Instant::now() + timeout)
            .with_cancel(cancel.clone());
        if capture_output {
            ctx = ctx.capturing_output();
        }

        let lowerer = Arc::clone(&self.lowerer);
        let task = Arc::clone(task);
        let schedule = schedule.clone();
        let target = target.clone();
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("schedforge-run".into())
            .spawn(move || {
                let job = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Timed, MeasureError> {
                    let func = lowerer.lower(&task.baseline, &schedule, &target)?;
                    ctx.check().map_err(|err| runtime_failure(err, timeout))?;
                    let exe = backend.compile(&func, &target)?;
                    run_repeated(exe.as_ref(), &ctx, warmup_runs, runs)
                        .map_err(|err| runtime_failure(err, timeout))
                }));
                let outcome = job.unwrap_or_else(|payload| {
                    Err(MeasureError::Runtime(format!(
                        "panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
                let _ = tx.send(outcome);
            });
        if let Err(err) = spawned {
            return Err(MeasureError::Runtime(format!(
                "cannot spawn execution thread: {}",
                err
            )));
        }

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                Err(MeasureError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(MeasureError::Runtime(
                "execution thread panicked".into(),
            )),
        }
    }
}

fn runtime_failure(err: RuntimeError, timeout: Duration) -> MeasureError {
    match err {
        RuntimeError::Timeout => MeasureError::Timeout(timeout),
        other => other.into(),
    }
}

fn run_repeated(
    exe: &dyn Executable,
    ctx: &RunContext,
    warmup_runs: usize,
    runs: usize,
) -> Result<Timed, RuntimeError> {
    for _ in 0..warmup_runs {
        exe.run(ctx)?;
    }
    let mut total = Duration::ZERO;
    let mut output = None;
    for _ in 0..runs.max(1) {
        let execution = exe.run(ctx)?;
        total += execution.elapsed;
        output = execution.output;
    }
    Ok((total / runs.max(1) as u32, output))
}

/// Largest absolute difference, or an error if any element is out of tolerance.
pub fn compare_outputs(
    got: &[f32],
    expected: &[f32],
    tolerance: Tolerance,
) -> Result<f64, MeasureError> {
    if got.len() != expected.len() {
        return Err(MeasureError::Runtime(format!(
            "output has {} elements, reference has {}",
            got.len(),
            expected.len()
        )));
    }
    let got = ArrayView1::from(got);
    let expected = ArrayView1::from(expected);
    let (max_abs_diff, within) = Zip::from(&got).and(&expected).fold(
        (0.0f64, true),
        |(max_diff, within), &g, &e| {
            let diff = (g as f64 - e as f64).abs();
            let allowed = tolerance.abs + tolerance.rel * (e as f64).abs();
            (max_diff.max(diff), within && diff <= allowed)
        },
    );
    if within {
        Ok(max_abs_diff)
    } else {
        Err(MeasureError::WrongAnswer { max_abs_diff })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schedforge_backend_cpu::CpuBackend;
    use schedforge_ir::{
        Backend, DynExecutable, Execution, FuncBuilder, LoopAnnotation, LoweredFunc,
        ScheduleLowerer, ScheduleStep,
    };

    /// Behaviour keyed on the loop nest shape:
    /// parallel hangs, vectorized fails to compile, unrolled panics, anything
    /// else takes one millisecond per loop and outputs the loop count.
    struct ScriptedBackend;

    enum Script {
        Fast(usize),
        Hang,
        Panic,
    }

    impl Executable for Script {
        fn run(&self, ctx: &RunContext) -> Result<Execution, RuntimeError> {
            match self {
                Script::Fast(loops) => Ok(Execution {
                    elapsed: Duration::from_millis(*loops as u64),
                    output: ctx.capture_output.then(|| vec![*loops as f32; 4]),
                }),
                Script::Hang => loop {
                    ctx.check()?;
                    thread::sleep(Duration::from_millis(2));
                },
                Script::Panic => panic!("scripted crash"),
            }
        }
    }

    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn arch(&self) -> Arch {
            Arch::Cpu
        }

        fn compile(&self, func: &LoweredFunc, _target: &Target) -> Result<DynExecutable, CompileError> {
            let has = |annotation: LoopAnnotation| {
                func.loops.iter().any(|lp| lp.annotation == annotation)
            };
            if has(LoopAnnotation::Vectorized) {
                return Err(CompileError::Codegen("no vector units".into()));
            }
            let script = if has(LoopAnnotation::Parallel) {
                Script::Hang
            } else if has(LoopAnnotation::Unrolled) {
                Script::Panic
            } else {
                Script::Fast(func.loops.len())
            };
            Ok(Arc::new(script))
        }
    }

    fn task() -> Arc<TuneTask> {
        let func = FuncBuilder::new("mm").matmul(8, 8, 8).expect("valid matmul");
        Arc::new(TuneTask::new("mm", func, Target::cpu(2)).expect("valid task"))
    }

    fn input(task: &Arc<TuneTask>, steps: Vec<ScheduleStep>, sequence: u64) -> MeasureInput {
        let state = SearchState::from_schedule(task, ScheduleDesc::new(steps), sequence)
            .expect("replayable schedule");
        MeasureInput::new(Arc::clone(task), state)
    }

    fn split(lp: &str) -> ScheduleStep {
        ScheduleStep::Split {
            lp: lp.into(),
            factor: 2,
        }
    }

    fn measurer(backend: impl Backend + 'static, options: MeasureOptions) -> ScheduleMeasurer {
        ScheduleMeasurer::new(
            Arc::new(ScheduleLowerer::new()),
            BackendRegistry::new().with_backend(backend),
            options,
        )
        .expect("valid options")
    }

    fn quick() -> MeasureOptions {
        MeasureOptions {
            warmup_runs: 0,
            runs: 1,
            timeout: Duration::from_millis(200),
            workers: 2,
            reference: None,
        }
    }

    #[test]
    fn hanging_candidate_times_out_in_place() {
        let task = task();
        let inputs = vec![
            input(&task, vec![], 0),
            input(&task, vec![split("i")], 1),
            input(&task, vec![split("j")], 2),
            input(&task, vec![ScheduleStep::Parallel { lp: "i".into() }], 3),
            input(&task, vec![split("k")], 4),
        ];
        let results = measurer(ScriptedBackend, quick()).measure(&inputs);
        assert_eq!(results.len(), inputs.len());
        assert!(matches!(results[3], MeasureResult::Failure(MeasureError::Timeout(_))));
        for index in [0, 1, 2, 4] {
            assert!(results[index].is_success(), "result {} failed", index);
        }
        assert_eq!(results[0].latency_ms(), Some(3.0));
        assert_eq!(results[1].latency_ms(), Some(4.0));
    }

    #[test]
    fn failures_are_classified_and_isolated() {
        let task = task();
        let inputs = vec![
            input(
                &task,
                vec![ScheduleStep::Unroll {
                    lp: "k".into(),
                    factor: 8,
                }],
                0,
            ),
            input(
                &task,
                vec![
                    ScheduleStep::Reorder {
                        first: "j".into(),
                        second: "k".into(),
                    },
                    ScheduleStep::Vectorize {
                        lp: "j".into(),
                        width: 8,
                    },
                ],
                1,
            ),
            input(&task, vec![], 2),
        ];
        let results = measurer(ScriptedBackend, quick()).measure(&inputs);
        match &results[0] {
            MeasureResult::Failure(MeasureError::Runtime(message)) => {
                assert!(message.contains("panicked"), "{}", message)
            }
            other => panic!("expected a runtime failure, got {:?}", other),
        }
        assert!(matches!(results[1], MeasureResult::Failure(MeasureError::Compile(_))));
        assert!(results[2].is_success());
    }

    #[test]
    fn illegal_schedule_fails_lowering() {
        let task = task();
        // two parallel loops are illegal on a CPU target
        let state = SearchState::from_schedule(
            &task,
            ScheduleDesc::new(vec![
                ScheduleStep::Parallel { lp: "i".into() },
                ScheduleStep::Parallel { lp: "j".into() },
            ]),
            0,
        )
        .expect("replayable");
        let results =
            measurer(ScriptedBackend, quick()).measure(&[MeasureInput::new(Arc::clone(&task), state)]);
        assert_eq!(results[0].latency_ms(), None);
        assert!(matches!(results[0], MeasureResult::Failure(MeasureError::Lowering(_))));
    }

    #[test]
    fn reference_check_flags_wrong_output() {
        let task = task();
        let options = MeasureOptions {
            reference: Some(Tolerance::default()),
            ..quick()
        };
        let inputs = vec![input(&task, vec![], 0), input(&task, vec![split("i")], 1)];
        let results = measurer(ScriptedBackend, options).measure(&inputs);
        // the scripted output is the loop count: 3 for the baseline, 4 after a split
        assert!(results[0].is_success());
        assert!(matches!(
            results[1],
            MeasureResult::Failure(MeasureError::WrongAnswer { .. })
        ));
    }

    #[test]
    fn reference_check_passes_for_real_cpu_schedules() {
        let task = task();
        let options = MeasureOptions {
            reference: Some(Tolerance::default()),
            timeout: Duration::from_secs(10),
            ..quick()
        };
        let inputs = vec![
            input(
                &task,
                vec![
                    ScheduleStep::Tile {
                        outer: "i".into(),
                        inner: "j".into(),
                        outer_factor: 4,
                        inner_factor: 2,
                    },
                    ScheduleStep::Parallel { lp: "i.o".into() },
                ],
                0,
            ),
            input(&task, vec![split("k")], 1),
        ];
        let results = measurer(CpuBackend::new(), options).measure(&inputs);
        for result in &results {
            assert!(result.is_success(), "{:?}", result);
        }
    }

    #[test]
    fn missing_backend_is_a_compile_failure() {
        let func = FuncBuilder::new("mm").matmul(8, 8, 8).expect("valid matmul");
        let task = Arc::new(TuneTask::new("mm", func, Target::gpu(2)).expect("valid task"));
        let results = measurer(ScriptedBackend, quick()).measure(&[input(&task, vec![], 0)]);
        assert!(matches!(
            results[0],
            MeasureResult::Failure(MeasureError::Compile(CompileError::UnsupportedTarget { .. }))
        ));
    }

    /// Accelerator model: one millisecond per loop, never any output.
    struct DeviceBackend;

    impl Backend for DeviceBackend {
        fn name(&self) -> &str {
            "device"
        }

        fn arch(&self) -> Arch {
            Arch::Gpu
        }

        fn compile(&self, func: &LoweredFunc, _target: &Target) -> Result<DynExecutable, CompileError> {
            struct Silent(usize);
            impl Executable for Silent {
                fn run(&self, _ctx: &RunContext) -> Result<Execution, RuntimeError> {
                    Ok(Execution {
                        elapsed: Duration::from_millis(self.0 as u64),
                        output: None,
                    })
                }
            }
            Ok(Arc::new(Silent(func.loops.len())))
        }
    }

    struct SlowCompiler(Duration);

    impl Backend for SlowCompiler {
        fn name(&self) -> &str {
            "slow"
        }

        fn arch(&self) -> Arch {
            Arch::Cpu
        }

        fn compile(&self, func: &LoweredFunc, target: &Target) -> Result<DynExecutable, CompileError> {
            thread::sleep(self.0);
            ScriptedBackend.compile(func, target)
        }
    }

    #[test]
    fn device_reference_falls_back_to_the_host() {
        let func = FuncBuilder::new("mm").matmul(8, 8, 8).expect("valid matmul");
        let task = Arc::new(TuneTask::new("mm", func, Target::gpu(2)).expect("valid task"));
        let options = MeasureOptions {
            reference: Some(Tolerance::default()),
            timeout: Duration::from_secs(10),
            ..quick()
        };
        let inputs = vec![input(&task, vec![], 0), input(&task, vec![split("i")], 1)];

        let with_host = ScheduleMeasurer::new(
            Arc::new(ScheduleLowerer::new()),
            BackendRegistry::new()
                .with_backend(DeviceBackend)
                .with_backend(CpuBackend::new()),
            options.clone(),
        )
        .expect("valid options");
        let results = with_host.measure(&inputs);
        for result in &results {
            assert!(result.is_success(), "{:?}", result);
        }
        assert_eq!(results[1].latency_ms(), Some(4.0));
        let cached = with_host.references.lock().expect("unpoisoned");
        assert!(matches!(cached.get(task.fingerprint()), Some(Some(output)) if !output.is_empty()));
        drop(cached);

        // no backend can produce the reference: measured unchecked
        let device_only = measurer(DeviceBackend, options);
        for result in device_only.measure(&inputs) {
            assert!(result.is_success(), "{:?}", result);
        }
        let cached = device_only.references.lock().expect("unpoisoned");
        assert_eq!(cached.get(task.fingerprint()), Some(&None));
    }

    #[test]
    fn slow_compilation_counts_against_the_timeout() {
        let task = task();
        let options = MeasureOptions {
            timeout: Duration::from_millis(50),
            ..quick()
        };
        let results = measurer(SlowCompiler(Duration::from_millis(500)), options)
            .measure(&[input(&task, vec![split("i")], 0)]);
        assert!(matches!(results[0], MeasureResult::Failure(MeasureError::Timeout(_))));
    }

    #[test]
    fn tolerance_is_relative_to_the_reference() {
        let tolerance = Tolerance { abs: 0.0, rel: 0.01 };
        assert!(compare_outputs(&[100.5], &[100.0], tolerance).is_ok());
        assert!(compare_outputs(&[1.5], &[1.0], tolerance).is_err());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = MeasureOptions {
            runs: 0,
            ..MeasureOptions::default()
        };
        assert!(ScheduleMeasurer::new(
            Arc::new(ScheduleLowerer::new()),
            BackendRegistry::new(),
            options
        )
        .is_err());
    }
}
