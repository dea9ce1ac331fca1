use anyhow::Result;
use schedforge::autotune::{
    compare_outputs, Database, MeasureOptions, Tolerance, TuneTask, DEFAULT_CAPACITY,
};
use schedforge::ir::{ElementwiseOp, FuncBuilder, ScheduleLowerer, Target};
use schedforge::optimizer::{StopReason, TuningOptions};
use schedforge::{default_backends, materialize, SessionOptions, TuningSession};
use std::sync::Arc;
use std::time::Duration;

fn session_options() -> SessionOptions {
    SessionOptions {
        measure: MeasureOptions {
            warmup_runs: 0,
            runs: 1,
            timeout: Duration::from_secs(10),
            workers: 2,
            reference: Some(Tolerance::default()),
        },
        task_workers: 2,
        ..SessionOptions::default()
    }
}

fn cpu_tasks() -> Result<Vec<Arc<TuneTask>>> {
    let matmul = FuncBuilder::new("mm").matmul(32, 16, 8)?;
    let relu = FuncBuilder::new("relu").elementwise(ElementwiseOp::Relu, &[16, 32])?;
    let sum = FuncBuilder::new("rowsum").reduce_sum(&[16, 16])?;
    Ok(vec![
        Arc::new(TuneTask::new("mm", matmul, Target::cpu(2))?),
        Arc::new(TuneTask::new("relu", relu, Target::cpu(2))?),
        Arc::new(TuneTask::new("rowsum", sum, Target::cpu(2))?),
    ])
}

#[test]
fn session_tunes_every_task_in_order() -> Result<()> {
    let tasks = cpu_tasks()?;
    let session = TuningSession::with_defaults(session_options())?;
    let results = session.tune_all(&tasks, &TuningOptions::quick())?;

    assert_eq!(results.len(), tasks.len());
    for (task, result) in tasks.iter().zip(&results) {
        assert_eq!(result.task, task.name);
        assert!(result.improved, "{} found nothing", task.name);
        let best = session
            .database()
            .best(task.fingerprint())
            .expect("best schedule recorded");
        assert_eq!(Some(best.cost), result.cost_ms);
    }
    Ok(())
}

#[test]
fn tuned_function_matches_baseline_output() -> Result<()> {
    let tasks = cpu_tasks()?;
    let session = TuningSession::with_defaults(session_options())?;
    let lowerer = ScheduleLowerer::new();
    let backends = default_backends();

    for task in &tasks {
        let tuned = session.tune(task, &TuningOptions::quick())?;
        let baseline = session.tune(task, &TuningOptions::no_measurement())?;
        assert!(!baseline.improved);

        let tuned = materialize(task, &tuned, &lowerer, &backends)?;
        let baseline = materialize(task, &baseline, &lowerer, &backends)?;
        let got = tuned.run(7)?.output.expect("captured output");
        let expected = baseline.run(7)?.output.expect("captured output");
        compare_outputs(&got, &expected, Tolerance::default())?;
    }
    Ok(())
}

#[test]
fn database_persists_across_sessions() -> Result<()> {
    let path = std::env::temp_dir().join(format!("schedforge-session-{}.json", std::process::id()));
    let tasks = cpu_tasks()?;
    let options = SessionOptions {
        database_path: Some(path.clone()),
        ..session_options()
    };

    let session = TuningSession::with_defaults(options.clone())?;
    let results = session.tune_all(&tasks[..1], &TuningOptions::quick())?;
    drop(session);

    let reopened = Database::open(&path, options.database_capacity);
    let best = reopened
        .best(tasks[0].fingerprint())
        .expect("persisted record");
    assert_eq!(Some(best.cost), results[0].cost_ms);
    assert_eq!(best.schedule, results[0].schedule);

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn failing_task_keeps_the_others_results() -> Result<()> {
    let path = std::env::temp_dir().join(format!("schedforge-partial-{}.json", std::process::id()));
    let tasks = cpu_tasks()?;
    let mut broken = TuneTask::new(
        "broken",
        FuncBuilder::new("broken").elementwise(ElementwiseOp::Relu, &[8, 8])?,
        Target::cpu(2),
    )?;
    // the nest no longer covers its axis, so feature extraction fails
    broken.baseline.loops[0].parts[0].extent = 3;
    let session = TuningSession::with_defaults(SessionOptions {
        database_path: Some(path.clone()),
        ..session_options()
    })?;

    let err = session.tune_all(&[Arc::clone(&tasks[0]), Arc::new(broken)], &TuningOptions::quick());
    assert!(err.is_err());

    let reopened = Database::open(&path, DEFAULT_CAPACITY);
    assert!(reopened.best(tasks[0].fingerprint()).is_some());
    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn gpu_reference_is_computed_on_the_host() -> Result<()> {
    let func = FuncBuilder::new("mm_gpu").matmul(64, 64, 16)?;
    let task = Arc::new(TuneTask::new("mm_gpu", func, Target::gpu(8))?);
    let session = TuningSession::with_defaults(session_options())?;
    let result = session.tune(&task, &TuningOptions::quick())?;

    // the device model never outputs; checking uses the host CPU baseline
    assert!(result.improved);
    assert!(result.stats.successes > 0);
    assert_eq!(result.stats.failures.get("wrong_answer"), None);
    assert!(session.database().best(task.fingerprint()).is_some());
    Ok(())
}

#[test]
fn gpu_tasks_run_on_the_device_model() -> Result<()> {
    let func = FuncBuilder::new("mm_gpu").matmul(64, 64, 16)?;
    let task = Arc::new(TuneTask::new("mm_gpu", func, Target::gpu(8))?);
    let session = TuningSession::with_defaults(SessionOptions {
        measure: MeasureOptions {
            reference: None,
            ..session_options().measure
        },
        ..session_options()
    })?;

    let options = TuningOptions {
        max_rounds: 6,
        ..TuningOptions::quick()
    };
    let result = session.tune(&task, &options)?;
    assert!(result.improved);
    assert!(result.cost_ms.is_some_and(|cost| cost > 0.0));

    let compiled = materialize(&task, &result, &ScheduleLowerer::new(), &default_backends())?;
    assert_eq!(compiled.backend, "gpu-occupancy-model");
    Ok(())
}

#[test]
fn cancelled_session_returns_baselines() -> Result<()> {
    let tasks = cpu_tasks()?;
    let session = TuningSession::with_defaults(session_options())?;
    session.cancellation().cancel();
    let results = session.tune_all(&tasks, &TuningOptions::quick())?;
    for result in &results {
        assert!(!result.improved);
        assert_eq!(result.stats.stop_reason, Some(StopReason::Cancelled));
    }
    assert_eq!(session.database().num_tasks(), 0);
    Ok(())
}

#[test]
fn materialize_rejects_foreign_results() -> Result<()> {
    let tasks = cpu_tasks()?;
    let session = TuningSession::with_defaults(session_options())?;
    let result = session.tune(&tasks[0], &TuningOptions::no_measurement())?;
    let err = materialize(&tasks[1], &result, &ScheduleLowerer::new(), &default_backends());
    assert!(err.is_err());
    Ok(())
}
