//! End-to-end scenarios against the in-memory store and the mock engine.

mod common;

use common::{script_for, submit};
use flowrun_core::engine::{EnginePhase, JobSpec};
use flowrun_core::error::{FlowrunError, ValidationErrorKind};
use flowrun_core::models::RunOverrides;
use flowrun_core::state_machine::RunPhase;
use flowrun_core::test_helpers::{cyclic_flow, numpy_task, sum_task, two_step_flow, TestHarness};

#[tokio::test]
async fn test_simple_task_runs_and_logs() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    assert_eq!(run.run_number, 1);
    assert_eq!(run.phase, RunPhase::Pending);

    let submitted = harness.engine.submitted_specs();
    assert_eq!(submitted.len(), 1);
    assert!(matches!(submitted[0], JobSpec::SingleStep(_)));
    assert!(script_for(&submitted[0], "main").contains("print(1+1)"));

    harness.engine.set_logs(&job_id, "main", "2\n");
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;

    let stored = harness.service.get_task_run(run.task_run_id).await.unwrap();
    assert_eq!(stored.phase, RunPhase::Succeeded);
    assert!(stored.started_at.is_some());
    assert!(stored.finished_at.is_some());

    let logs = harness.service.get_logs(run.task_run_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].content, "2\n");
}

#[tokio::test]
async fn test_two_step_flow_hands_off_and_logs_42() {
    let harness = TestHarness::new();
    let flow = harness.service.create_flow(&two_step_flow()).await.unwrap();
    let detail = harness.service.submit_flow(flow.flow_id).await.unwrap();

    assert_eq!(detail.run.run_number, 1);
    assert_eq!(detail.steps.len(), 2);
    assert!(detail.steps.iter().all(|s| s.phase == RunPhase::Pending));

    let submitted = harness.engine.submitted_specs();
    let JobSpec::MultiStepDag(dag) = &submitted[0] else {
        panic!("flows compile to multi-step jobs");
    };
    let order: Vec<&str> = dag.templates.iter().map(|t| t.step_id.as_str()).collect();
    assert_eq!(order, vec!["A", "B"]);
    let task_b = dag.tasks.iter().find(|t| t.template == "step-b").unwrap();
    assert_eq!(task_b.dependencies, vec!["step-a".to_string()]);
    // B loads A's output from the shared volume
    assert!(script_for(&submitted[0], "B").contains("_PREDECESSORS = [\"A\"]"));
    assert!(script_for(&submitted[0], "A").contains("_PREDECESSORS = []"));

    let job_id = detail.run.external_job_id.clone().unwrap();
    harness.engine.set_logs(&job_id, "step-b", "42\n");
    harness
        .finish_run(
            detail.run.flow_run_id,
            &job_id,
            EnginePhase::Succeeded,
            &["step-a", "step-b"],
        )
        .await;

    let detail = harness.service.get_flow_run(detail.run.flow_run_id).await.unwrap();
    assert_eq!(detail.run.phase, RunPhase::Succeeded);
    assert!(detail.steps.iter().all(|s| s.phase == RunPhase::Succeeded));
    assert!(detail.steps.iter().all(|s| s.external_node_id.is_some()));

    let logs = harness.service.get_logs(detail.run.flow_run_id).await.unwrap();
    let b = logs.iter().find(|e| e.step_id == "B").unwrap();
    assert_eq!(b.content, "42\n");
}

#[tokio::test]
async fn test_cyclic_flow_is_rejected_before_submission() {
    let harness = TestHarness::new();
    let flow = harness.service.create_flow(&cyclic_flow()).await.unwrap();

    let err = harness.service.submit_flow(flow.flow_id).await.unwrap_err();
    assert_eq!(
        err.validation_kind(),
        Some(ValidationErrorKind::CyclicDependency)
    );
    assert_eq!(harness.engine.submit_calls(), 0);
    assert!(harness
        .service
        .list_flow_runs(flow.flow_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rerun_without_override_keeps_numpy() {
    let harness = TestHarness::new();
    let (first, job_id) = submit(&harness, &numpy_task()).await;
    harness
        .finish_run(first.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;

    let rerun = harness
        .service
        .rerun_task(first.task_run_id, &RunOverrides::none())
        .await
        .unwrap();
    assert_eq!(rerun.run_number, 2);
    assert_eq!(rerun.snapshot.package_dependencies.as_deref(), Some("numpy"));
    assert_eq!(rerun.snapshot.code, first.snapshot.code);

    let submitted = harness.engine.submitted_specs();
    assert!(script_for(&submitted[1], "main").contains("numpy"));
}

#[tokio::test]
async fn test_failed_step_is_identifiable() {
    let harness = TestHarness::new();
    let flow = harness.service.create_flow(&two_step_flow()).await.unwrap();
    let detail = harness.service.submit_flow(flow.flow_id).await.unwrap();
    let job_id = detail.run.external_job_id.clone().unwrap();

    harness.engine.set_job_phase(
        &job_id,
        EnginePhase::Failed,
        &[("step-a", EnginePhase::Failed), ("step-b", EnginePhase::Omitted)],
    );
    harness.service.reconcile(detail.run.flow_run_id).await.unwrap();

    let detail = harness.service.get_flow_run(detail.run.flow_run_id).await.unwrap();
    assert_eq!(detail.run.phase, RunPhase::Failed);
    assert!(detail.run.error_message.as_deref().unwrap().contains("step-a"));
    let failed: Vec<&str> = detail.failed_steps().map(|s| s.step_id.as_str()).collect();
    assert_eq!(failed, vec!["A"]);
}

#[tokio::test]
async fn test_not_found_is_surfaced() {
    let harness = TestHarness::new();
    let err = harness
        .service
        .submit_task(uuid::Uuid::new_v4(), &RunOverrides::none())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowrunError::NotFound { entity: "task", .. }));
}
