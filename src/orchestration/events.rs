//! In-process notification of applied run phase transitions.

use crate::models::RunKind;
use crate::state_machine::RunPhase;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A phase change applied to a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseTransition {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub run_number: i32,
    pub from: RunPhase,
    pub to: RunPhase,
    /// Event type that caused the change
    pub cause: &'static str,
    pub at: DateTime<Utc>,
}

/// Broadcasts applied run transitions to in-process listeners
#[derive(Debug, Clone)]
pub struct RunEventPublisher {
    sender: broadcast::Sender<PhaseTransition>,
}

impl RunEventPublisher {
    /// Create a new publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, transition: PhaseTransition) {
        // send() only fails when nobody is subscribed, which is fine
        let _ = self.sender.send(transition);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhaseTransition> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RunEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EnginePhase;
    use crate::models::RunOverrides;
    use crate::test_helpers::{sum_task, TestHarness};

    #[test]
    fn test_publish_without_subscribers_is_ignored() {
        let publisher = RunEventPublisher::new(4);
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(PhaseTransition {
            run_id: Uuid::new_v4(),
            kind: RunKind::Task,
            run_number: 1,
            from: RunPhase::Pending,
            to: RunPhase::Running,
            cause: "observed",
            at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_reconcile_publishes_each_applied_transition() {
        let harness = TestHarness::new();
        let mut events = harness.service.events().subscribe();

        let task = harness.service.create_task(&sum_task()).await.unwrap();
        let run = harness
            .service
            .submit_task(task.task_id, &RunOverrides::none())
            .await
            .unwrap();
        let job_id = run.external_job_id.clone().unwrap();

        harness
            .engine
            .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
        harness.service.reconcile(run.task_run_id).await.unwrap();
        // no change, no event
        harness.service.reconcile(run.task_run_id).await.unwrap();
        harness
            .finish_run(run.task_run_id, &job_id, EnginePhase::Succeeded, &["main"])
            .await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.run_id, run.task_run_id);
        assert_eq!((first.from, first.to), (RunPhase::Pending, RunPhase::Running));
        assert_eq!(first.run_number, 1);

        let second = events.recv().await.unwrap();
        assert_eq!((second.from, second.to), (RunPhase::Running, RunPhase::Succeeded));
        assert!(events.try_recv().is_err());
    }
}
