//! Log cache convergence and live streaming through the service.

mod common;

use common::submit;
use flowrun_core::engine::EnginePhase;
use flowrun_core::logs::{
    forward_to_observer, BackoffPolicy, ConnectionState, ForwardOutcome, LogUpdate,
    ObserverTransport, TransportError,
};
use flowrun_core::state_machine::RunPhase;
use flowrun_core::test_helpers::{sum_task, two_step_flow, TestHarness};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::test]
async fn test_terminal_run_logs_converge_to_store_reads() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness.engine.set_logs(&job_id, "main", "2\n");
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;

    let first = harness.service.get_logs(run.task_run_id).await.unwrap();
    let calls_after_first = harness.engine.log_calls();
    let second = harness.service.get_logs(run.task_run_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(calls_after_first, 1);
    assert_eq!(harness.engine.log_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_reads_share_one_fetch() {
    let harness = Arc::new(TestHarness::new());
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness.engine.set_logs(&job_id, "main", "2\n");
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let harness = Arc::clone(&harness);
            let run_id = run.task_run_id;
            tokio::spawn(async move { harness.service.get_logs(run_id).await.unwrap() })
        })
        .collect();
    for handle in handles {
        let entries = handle.await.unwrap();
        assert_eq!(entries[0].content, "2\n");
    }
    assert_eq!(harness.engine.log_calls(), 1);
}

#[tokio::test]
async fn test_flow_logs_are_keyed_by_step() {
    let harness = TestHarness::new();
    let flow = harness.service.create_flow(&two_step_flow()).await.unwrap();
    let detail = harness.service.submit_flow(flow.flow_id).await.unwrap();
    let job_id = detail.run.external_job_id.clone().unwrap();

    harness.engine.set_logs(&job_id, "step-a", "");
    harness.engine.set_logs(&job_id, "step-b", "42\n");
    harness
        .finish_run(
            detail.run.flow_run_id,
            &job_id,
            EnginePhase::Succeeded,
            &["step-a", "step-b"],
        )
        .await;

    let logs = harness.service.get_logs(detail.run.flow_run_id).await.unwrap();
    let steps: Vec<&str> = logs.iter().map(|e| e.step_id.as_str()).collect();
    assert_eq!(steps, vec!["A", "B"]);
    assert!(logs.iter().all(|e| e.phase == RunPhase::Succeeded));
    assert!(logs.iter().all(|e| !e.pod_id.is_empty()));
}

#[tokio::test]
async fn test_finished_flow_with_unscheduled_step_reads_from_store() {
    let harness = TestHarness::new();
    let flow = harness.service.create_flow(&two_step_flow()).await.unwrap();
    let detail = harness.service.submit_flow(flow.flow_id).await.unwrap();
    let run_id = detail.run.flow_run_id;
    let job_id = detail.run.external_job_id.clone().unwrap();

    harness.engine.set_logs(&job_id, "step-a", "boom\n");
    harness.engine.set_job_phase(
        &job_id,
        EnginePhase::Failed,
        &[
            ("step-a", EnginePhase::Failed),
            ("step-b", EnginePhase::Omitted),
        ],
    );
    harness.service.reconcile(run_id).await.unwrap();

    let first = harness.service.get_logs(run_id).await.unwrap();
    let status_calls = harness.engine.status_calls();
    let log_calls = harness.engine.log_calls();
    let second = harness.service.get_logs(run_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.engine.status_calls(), status_calls);
    assert_eq!(harness.engine.log_calls(), log_calls);
    let b = first.iter().find(|e| e.step_id == "B").unwrap();
    assert_eq!(b.content, "");
    assert!(b.phase.is_terminal());
}

#[tokio::test]
async fn test_deleted_run_loses_its_logs() {
    let harness = TestHarness::new();
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness.engine.set_logs(&job_id, "main", "2\n");
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;
    harness.service.get_logs(run.task_run_id).await.unwrap();

    harness.service.delete_run(run.task_run_id).await.unwrap();
    assert!(harness.service.get_logs(run.task_run_id).await.is_err());
}

/// Collects everything it is sent
#[derive(Default)]
struct Recorder {
    updates: Vec<LogUpdate>,
}

#[async_trait::async_trait]
impl ObserverTransport for Recorder {
    async fn send(&mut self, update: &LogUpdate) -> Result<(), TransportError> {
        self.updates.push(update.clone());
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_stream_follows_flow_to_completion_with_reconciler() {
    let harness = TestHarness::new();
    let flow = harness.service.create_flow(&two_step_flow()).await.unwrap();
    let detail = harness.service.submit_flow(flow.flow_id).await.unwrap();
    let run_id = detail.run.flow_run_id;
    let job_id = detail.run.external_job_id.clone().unwrap();

    harness
        .engine
        .set_job_phase(&job_id, EnginePhase::Running, &[("step-a", EnginePhase::Running)]);
    harness.engine.set_logs(&job_id, "step-a", "computing\n");

    let (reconciler, shutdown) = Arc::new(harness.service.reconciler()).spawn();
    let mut subscription = harness.service.stream_logs(run_id).await.unwrap();

    let first = subscription.recv().await.unwrap();
    let LogUpdate::Snapshot { entries, .. } = &first else {
        panic!("expected a snapshot, got {first:?}");
    };
    assert_eq!(entries[0].content, "computing\n");

    harness.engine.set_logs(&job_id, "step-b", "42\n");
    harness.engine.set_job_phase(
        &job_id,
        EnginePhase::Succeeded,
        &[
            ("step-a", EnginePhase::Succeeded),
            ("step-b", EnginePhase::Succeeded),
        ],
    );

    let mut recorder = Recorder::default();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
    let outcome = forward_to_observer(
        subscription,
        &mut recorder,
        &BackoffPolicy::default(),
        &state_tx,
    )
    .await;

    assert_eq!(outcome, ForwardOutcome::Completed(RunPhase::Succeeded));
    assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    let Some(LogUpdate::Snapshot { entries, run_phase, .. }) = recorder
        .updates
        .iter()
        .rev()
        .find(|u| matches!(u, LogUpdate::Snapshot { .. }))
    else {
        panic!("expected a final snapshot");
    };
    assert_eq!(*run_phase, RunPhase::Succeeded);
    let b = entries.iter().find(|e| e.step_id == "B").unwrap();
    assert_eq!(b.content, "42\n");

    let _ = shutdown.send(true);
    reconciler.await.unwrap();
    assert_eq!(harness.service.log_sync().active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_racing_task_delete_leaves_no_records() {
    use flowrun_core::store::RunStore;

    let harness = Arc::new(TestHarness::new());
    let (run, job_id) = submit(&harness, &sum_task()).await;
    harness.engine.set_logs(&job_id, "main", "2\n");
    harness
        .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
        .await;
    let gate = harness.engine.hold_log_fetches();

    let fetching = {
        let harness = Arc::clone(&harness);
        let run_id = run.task_run_id;
        tokio::spawn(async move { harness.service.get_logs(run_id).await })
    };
    while harness.engine.log_calls() == 0 {
        tokio::task::yield_now().await;
    }

    harness.service.delete_task(run.task_id).await.unwrap();
    gate.add_permits(1);
    assert!(fetching.await.unwrap().is_err());

    let records = harness.store.get_log_records(run.task_run_id).await.unwrap();
    assert!(records.is_empty());
}
