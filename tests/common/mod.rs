#![allow(dead_code)]

pub mod strategies;

pub use strategies::*;

use flowrun_core::engine::JobSpec;
use flowrun_core::models::{RunOverrides, TaskDefinition, TaskRun};
use flowrun_core::test_helpers::TestHarness;

/// Create and submit a task; returns the run and its engine job id.
pub async fn submit(harness: &TestHarness, definition: &TaskDefinition) -> (TaskRun, String) {
    let task = harness.service.create_task(definition).await.unwrap();
    let run = harness
        .service
        .submit_task(task.task_id, &RunOverrides::none())
        .await
        .unwrap();
    let job_id = run.external_job_id.clone().expect("submitted run has a job id");
    (run, job_id)
}

/// Script of the template executing `step_id` in a submitted job
pub fn script_for<'a>(spec: &'a JobSpec, step_id: &str) -> &'a str {
    match spec {
        JobSpec::SingleStep(single) => &single.template.script,
        JobSpec::MultiStepDag(dag) => dag
            .templates
            .iter()
            .find(|t| t.step_id == step_id)
            .map(|t| t.script.as_str())
            .expect("template for step"),
    }
}
