//! # Job Specification
//!
//! Declarative description of what the engine should run. A job is either a
//! single script or a DAG of script templates sharing one volume; the
//! submitter branches on that tag, never on the shape of partially built data.
//!
//! [`JobSpec::to_manifest`] renders the engine's `Workflow` resource.

use crate::constants::{job, volume};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Engine template name for a step id: lowercase, `_` replaced by `-`.
pub fn template_name_for(step_id: &str) -> String {
    format!(
        "{}{}",
        job::STEP_TEMPLATE_PREFIX,
        step_id.to_ascii_lowercase().replace('_', "-")
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Prefix the engine completes into a unique job name
    pub generate_name: String,
    pub labels: BTreeMap<String, String>,
    pub service_account: Option<String>,
}

impl JobMetadata {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// One container executing a generated shell script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptTemplate {
    pub name: String,
    pub step_id: String,
    pub image: String,
    pub script: String,
    pub mounts_shared_volume: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleStepJob {
    pub metadata: JobMetadata,
    pub template: ScriptTemplate,
}

/// Node of the job's dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagTask {
    pub name: String,
    pub template: String,
    /// Names of tasks that must complete first
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedVolume {
    pub name: String,
    pub mount_path: String,
    pub size: String,
}

impl SharedVolume {
    pub fn with_size(size: impl Into<String>) -> Self {
        Self {
            name: volume::VOLUME_NAME.to_string(),
            mount_path: volume::SHARED_ROOT.to_string(),
            size: size.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepDagJob {
    pub metadata: JobMetadata,
    pub volume: SharedVolume,
    /// In topological order
    pub templates: Vec<ScriptTemplate>,
    pub tasks: Vec<DagTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    SingleStep(SingleStepJob),
    MultiStepDag(MultiStepDagJob),
}

impl JobSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SingleStep(_) => "single_step",
            Self::MultiStepDag(_) => "multi_step_dag",
        }
    }

    pub fn metadata(&self) -> &JobMetadata {
        match self {
            Self::SingleStep(single) => &single.metadata,
            Self::MultiStepDag(dag) => &dag.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut JobMetadata {
        match self {
            Self::SingleStep(single) => &mut single.metadata,
            Self::MultiStepDag(dag) => &mut dag.metadata,
        }
    }

    /// Step id to template name, for mapping engine sub-units back to steps
    pub fn step_templates(&self) -> BTreeMap<String, String> {
        match self {
            Self::SingleStep(single) => BTreeMap::from([(
                single.template.step_id.clone(),
                single.template.name.clone(),
            )]),
            Self::MultiStepDag(dag) => dag
                .templates
                .iter()
                .map(|t| (t.step_id.clone(), t.name.clone()))
                .collect(),
        }
    }

    /// Render the engine `Workflow` resource.
    pub fn to_manifest(&self) -> Value {
        let metadata = self.metadata();
        let mut spec = match self {
            Self::SingleStep(single) => json!({
                "entrypoint": job::ENTRYPOINT,
                "templates": [script_template_manifest(&single.template, None)],
            }),
            Self::MultiStepDag(dag) => {
                let tasks: Vec<Value> = dag
                    .tasks
                    .iter()
                    .map(|task| {
                        let mut node = json!({ "name": task.name, "template": task.template });
                        if !task.dependencies.is_empty() {
                            node["dependencies"] = json!(task.dependencies);
                        }
                        node
                    })
                    .collect();

                let mut templates = vec![json!({
                    "name": job::ENTRYPOINT,
                    "dag": { "tasks": tasks },
                })];
                templates.extend(
                    dag.templates
                        .iter()
                        .map(|t| script_template_manifest(t, Some(&dag.volume))),
                );

                json!({
                    "entrypoint": job::ENTRYPOINT,
                    "volumeClaimTemplates": [{
                        "metadata": { "name": dag.volume.name },
                        "spec": {
                            "accessModes": ["ReadWriteOnce"],
                            "resources": { "requests": { "storage": dag.volume.size } },
                        },
                    }],
                    "templates": templates,
                })
            }
        };

        if let Some(account) = &metadata.service_account {
            spec["serviceAccountName"] = json!(account);
        }

        json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Workflow",
            "metadata": {
                "generateName": metadata.generate_name,
                "labels": metadata.labels,
            },
            "spec": spec,
        })
    }
}

fn script_template_manifest(template: &ScriptTemplate, volume: Option<&SharedVolume>) -> Value {
    let mut script = json!({
        "image": template.image,
        "command": ["bash"],
        "source": template.script,
    });

    if let (true, Some(volume)) = (template.mounts_shared_volume, volume) {
        script["volumeMounts"] = json!([{ "name": volume.name, "mountPath": volume.mount_path }]);
    }

    json!({ "name": template.name, "script": script })
}
