//! Run numbering, snapshots, phase stickiness and cancellation.

mod common;

use common::{script_for, submit};
use flowrun_core::engine::EnginePhase;
use flowrun_core::models::{RunOverrides, TaskDefinition};
use flowrun_core::orchestration::{CancelOutcome, ReconcileOutcome};
use flowrun_core::state_machine::RunPhase;
use flowrun_core::test_helpers::{sum_task, test_config, two_step_flow, TestHarness};
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_number_runs_one_to_n() {
    const N: i32 = 24;
    let harness = Arc::new(TestHarness::new());
    let task = harness.service.create_task(&sum_task()).await.unwrap();

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let harness = Arc::clone(&harness);
            let task_id = task.task_id;
            tokio::spawn(async move {
                harness
                    .service
                    .submit_task(task_id, &RunOverrides::none())
                    .await
                    .unwrap()
                    .run_number
            })
        })
        .collect();

    let mut numbers = BTreeSet::new();
    for handle in handles {
        numbers.insert(handle.await.unwrap());
    }
    assert_eq!(numbers, (1..=N).collect::<BTreeSet<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_flow_submissions_number_runs_one_to_n() {
    const N: i32 = 12;
    let harness = Arc::new(TestHarness::new());
    let flow = harness.service.create_flow(&two_step_flow()).await.unwrap();

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let harness = Arc::clone(&harness);
            let flow_id = flow.flow_id;
            tokio::spawn(async move {
                harness.service.submit_flow(flow_id).await.unwrap().run.run_number
            })
        })
        .collect();

    let mut numbers = BTreeSet::new();
    for handle in handles {
        numbers.insert(handle.await.unwrap());
    }
    assert_eq!(numbers, (1..=N).collect::<BTreeSet<_>>());
}

#[tokio::test]
async fn test_task_edits_never_rewrite_run_snapshots() {
    let harness = TestHarness::new();
    let (run, _) = submit(&harness, &sum_task()).await;

    harness
        .service
        .update_task(
            run.task_id,
            &TaskDefinition::new("sum", "print(40+2)").with_package_dependencies("pandas"),
        )
        .await
        .unwrap();

    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.snapshot.code, "print(1+1)");
    assert_eq!(stored.snapshot.package_dependencies, None);

    let second = harness
        .service
        .submit_task(run.task_id, &RunOverrides::none())
        .await
        .unwrap();
    assert_eq!(second.snapshot.code, "print(40+2)");
    assert_eq!(second.run_number, 2);
}

#[tokio::test]
async fn test_overrides_apply_to_one_run_only() {
    let harness = TestHarness::new();
    let task = harness.service.create_task(&sum_task()).await.unwrap();

    let run = harness
        .service
        .submit_task(
            task.task_id,
            &RunOverrides::none().with_code("print('override')"),
        )
        .await
        .unwrap();
    assert_eq!(run.snapshot.code, "print('override')");
    assert_eq!(harness.service.get_task(task.task_id).await.unwrap().code, "print(1+1)");
}

#[tokio::test]
async fn test_rerun_takes_system_dependencies_from_task() {
    let harness = TestHarness::new();
    let (first, _) = submit(
        &harness,
        &TaskDefinition::new("plot", "print(1)").with_system_dependencies("libgomp1"),
    )
    .await;
    harness
        .service
        .update_task(
            first.task_id,
            &TaskDefinition::new("plot", "print(1)").with_system_dependencies("graphviz"),
        )
        .await
        .unwrap();

    let rerun = harness
        .service
        .rerun_task(first.task_run_id, &RunOverrides::none())
        .await
        .unwrap();
    assert_eq!(rerun.snapshot.system_dependencies.as_deref(), Some("graphviz"));
    let submitted = harness.engine.submitted_specs();
    assert!(script_for(&submitted[1], "main").contains("graphviz"));
}

#[tokio::test]
async fn test_terminal_phase_is_sticky() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;

    for phase in [EnginePhase::Running, EnginePhase::Failed, EnginePhase::Pending] {
        harness.engine.set_job_phase(&job_id, phase, &[("main", phase)]);
        assert_eq!(
            harness.service.reconcile(run.task_run_id).await.unwrap(),
            ReconcileOutcome::AlreadyTerminal(RunPhase::Succeeded)
        );
    }
    harness.engine.remove_job(&job_id);
    harness.service.reconcile(run.task_run_id).await.unwrap();

    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Succeeded);
}

#[tokio::test]
async fn test_stale_report_never_regresses_running_run() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;

    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
    harness.service.reconcile(run.task_run_id).await.unwrap();

    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Pending, &[("main", EnginePhase::Pending)]);
    assert_eq!(
        harness.service.reconcile(run.task_run_id).await.unwrap(),
        ReconcileOutcome::Unchanged(RunPhase::Running)
    );
}

#[tokio::test]
async fn test_unknown_job_reads_as_not_started() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness.engine.remove_job(&job_id);

    // not an error, and idempotent
    for _ in 0..2 {
        harness.service.reconcile(run.task_run_id).await.unwrap();
    }
    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::NotStarted);
}

#[tokio::test]
async fn test_cancel_marks_stopped_run_cancelled() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
    harness.service.reconcile(run.task_run_id).await.unwrap();

    assert_eq!(
        harness.service.cancel(run.task_run_id).await.unwrap(),
        CancelOutcome::Requested
    );
    assert_eq!(harness.engine.cancel_calls(), 1);

    // the engine stopped the job, reported as a failure
    harness.service.reconcile(run.task_run_id).await.unwrap();
    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Cancelled);
    assert!(stored.cancel_requested_at.is_some());
}

#[tokio::test]
async fn test_success_after_cancel_request_still_wins() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness.engine.set_stop_on_cancel(false);

    harness.service.cancel(run.task_run_id).await.unwrap();
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;

    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Succeeded);
}

#[tokio::test]
async fn test_cancel_timeout_forces_cancelled() {
    let mut config = test_config();
    config.reconciler.cancel_timeout_secs = 0;
    let harness = TestHarness::with_config(config);
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
    harness.engine.set_stop_on_cancel(false);

    harness.service.cancel(run.task_run_id).await.unwrap();
    assert_eq!(
        harness.service.reconcile(run.task_run_id).await.unwrap(),
        ReconcileOutcome::Transitioned {
            from: RunPhase::Pending,
            to: RunPhase::Cancelled
        }
    );
}

#[tokio::test]
async fn test_ignored_cancel_is_repeated_until_timeout() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
    harness.engine.set_stop_on_cancel(false);

    harness.service.cancel(run.task_run_id).await.unwrap();
    harness.service.reconcile(run.task_run_id).await.unwrap();
    harness.service.reconcile(run.task_run_id).await.unwrap();

    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Running);
    assert_eq!(harness.engine.cancel_calls(), 3);
}

#[tokio::test]
async fn test_cancelled_flow_closes_open_steps() {
    let harness = TestHarness::new();
    let flow = harness.service.create_flow(&two_step_flow()).await.unwrap();
    let detail = harness.service.submit_flow(flow.flow_id).await.unwrap();
    let job_id = detail.run.external_job_id.clone().unwrap();

    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Running, &[("step-a", EnginePhase::Running)]);
    harness.service.reconcile(detail.run.flow_run_id).await.unwrap();
    harness.service.cancel(detail.run.flow_run_id).await.unwrap();
    harness.service.reconcile(detail.run.flow_run_id).await.unwrap();

    let detail = harness.service.get_flow_run(detail.run.flow_run_id).await.unwrap();
    assert_eq!(detail.run.phase, RunPhase::Cancelled);
    assert!(detail.steps.iter().all(|s| s.phase.is_terminal()));
    let b = detail.steps.iter().find(|s| s.step_id == "B").unwrap();
    assert_eq!(b.phase, RunPhase::Cancelled);
}

#[tokio::test]
async fn test_cancel_and_reconcile_of_terminal_run_are_noops() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Failed, &["main"])
        .await;

    assert_eq!(
        harness.service.cancel(run.task_run_id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(RunPhase::Failed)
    );
    assert_eq!(
        harness.service.reconcile(run.task_run_id).await.unwrap(),
        ReconcileOutcome::AlreadyTerminal(RunPhase::Failed)
    );
    assert_eq!(harness.engine.cancel_calls(), 0);
}

#[tokio::test]
async fn test_delete_task_cascades_and_stops_active_jobs() {
    let harness = TestHarness::new();
    let (run, _) = submit(&harness, &sum_task()).await;
    harness.service.get_logs(run.task_run_id).await.unwrap();

    harness.service.delete_task(run.task_id).await.unwrap();

    assert_eq!(harness.engine.cancel_calls(), 1);
    assert!(harness.service.get_task_run(run.task_run_id).await.is_err());
    assert!(harness.service.get_run(run.task_run_id).await.is_err());
    assert!(harness.service.delete_task(run.task_id).await.is_err());
}

#[tokio::test]
async fn test_reconciler_pass_moves_every_active_run() {
    let harness = TestHarness::new();
    let (first, first_job) = submit(&harness, &sum_task()).await;
    let (second, second_job) = submit(&harness, &sum_task()).await;
    for job_id in [&first_job, &second_job] {
        harness
            .engine
            .set_job_phase(job_id, EnginePhase::Succeeded, &[("main", EnginePhase::Succeeded)]);
    }

    let summary = harness.service.reconciler().reconcile_once().await.unwrap();
    assert_eq!(summary.examined, 2);
    assert_eq!(summary.transitioned, 2);

    for run_id in [first.task_run_id, second.task_run_id] {
        let stored = harness.service.get_task_run(run_id).await.unwrap();
        assert_eq!(stored.phase, RunPhase::Succeeded);
    }
    let again = harness.service.reconciler().reconcile_once().await.unwrap();
    assert_eq!(again.examined, 0);
}

#[tokio::test]
async fn test_reconciler_absorbs_unreachable_engine() {
    let harness = TestHarness::new();
    submit(&harness, &sum_task()).await;
    harness.engine.set_unavailable(true);

    let summary = harness.service.reconciler().reconcile_once().await.unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_expired_cancel_applies_while_engine_is_unreachable() {
    let mut config = test_config();
    config.reconciler.cancel_timeout_secs = 0;
    let harness = TestHarness::with_config(config);
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
    harness.service.reconcile(run.task_run_id).await.unwrap();

    harness.service.cancel(run.task_run_id).await.unwrap();
    harness.engine.set_unavailable(true);

    assert_eq!(
        harness.service.reconcile(run.task_run_id).await.unwrap(),
        ReconcileOutcome::Transitioned {
            from: RunPhase::Running,
            to: RunPhase::Cancelled
        }
    );
    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Cancelled);
}

#[tokio::test]
async fn test_unexpired_cancel_waits_for_reachable_engine() {
    let harness = TestHarness::new();
    let (run, _) = submit(&harness, &sum_task()).await;

    harness.service.cancel(run.task_run_id).await.unwrap();
    harness.engine.set_unavailable(true);

    let err = harness.service.reconcile(run.task_run_id).await.unwrap_err();
    assert!(err.is_transient());
    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submission_failure_wins_over_concurrent_reconcile() {
    let harness = Arc::new(TestHarness::new());
    let task = harness.service.create_task(&sum_task()).await.unwrap();
    let gate = harness.engine.hold_submissions();

    let submitting = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move {
            harness
                .service
                .submit_task(task.task_id, &RunOverrides::none())
                .await
        })
    };
    while harness.engine.submit_calls() == 0 {
        tokio::task::yield_now().await;
    }

    // the row exists without a job id, so the reconciler reads it as not started
    let runs = harness.service.list_task_runs(task.task_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].task_run_id;
    assert_eq!(
        harness.service.reconcile(run_id).await.unwrap(),
        ReconcileOutcome::Transitioned {
            from: RunPhase::Pending,
            to: RunPhase::NotStarted
        }
    );

    harness.engine.set_unavailable(true);
    gate.add_permits(1);
    assert!(submitting.await.unwrap().is_err());

    let stored = harness.service.get_task_run(run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Failed);
    let summary = harness.service.reconciler().reconcile_once().await.unwrap();
    assert_eq!(summary.examined, 0);
}
