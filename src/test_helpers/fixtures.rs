//! Fixture definitions and an in-memory service wired to a [`MockEngine`].

use super::mock_engine::MockEngine;
use crate::config::FlowrunConfig;
use crate::engine::EnginePhase;
use crate::models::{FlowDefinition, Step, TaskDefinition};
use crate::service::FlowrunService;
use crate::store::InMemoryRunStore;
use std::sync::Arc;

/// `print(1+1)` with no dependencies
pub fn sum_task() -> TaskDefinition {
    TaskDefinition::new("sum", "print(1+1)")
}

/// A task that imports numpy and declares it as a package dependency
pub fn numpy_task() -> TaskDefinition {
    TaskDefinition::new("stats", "import numpy as np\nprint(np.arange(3).sum())")
        .with_package_dependencies("numpy")
}

/// A(`y = 21`) -> B(`print(y*2)`)
pub fn two_step_flow() -> FlowDefinition {
    FlowDefinition::new("answer")
        .with_step(Step::new("A", "y = 21").with_name("produce"))
        .with_step(Step::new("B", "print(y*2)").with_name("consume"))
        .with_edge("A", "B")
}

/// A -> B -> A
pub fn cyclic_flow() -> FlowDefinition {
    FlowDefinition::new("loop")
        .with_step(Step::new("A", "x = 1"))
        .with_step(Step::new("B", "x = 2"))
        .with_edge("A", "B")
        .with_edge("B", "A")
}

/// Defaults with intervals short enough for paused-clock tests
pub fn test_config() -> FlowrunConfig {
    let mut config = FlowrunConfig::default();
    config.reconciler.interval_ms = 100;
    config.reconciler.cancel_timeout_secs = 30;
    config.log_sync.poll_interval_ms = 100;
    config
}

/// In-memory service with direct handles on its store and engine
pub struct TestHarness {
    pub store: Arc<InMemoryRunStore>,
    pub engine: Arc<MockEngine>,
    pub service: FlowrunService,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: FlowrunConfig) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        let engine = Arc::new(MockEngine::new());
        let service = FlowrunService::new(store.clone(), engine.clone(), config);
        Self {
            store,
            engine,
            service,
        }
    }

    /// Mark every listed template finished in the engine and reconcile the run.
    pub async fn finish_run(
        &self,
        run_id: uuid::Uuid,
        job_id: &str,
        phase: EnginePhase,
        templates: &[&str],
    ) {
        let units: Vec<(&str, EnginePhase)> = templates.iter().map(|t| (*t, phase)).collect();
        self.engine.set_job_phase(job_id, phase, &units);
        self.service
            .reconcile(run_id)
            .await
            .expect("reconcile after engine finished");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
