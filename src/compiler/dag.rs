//! # DAG Compiler
//!
//! Validates a flow's steps and edges, orders them topologically and builds
//! the multi-step job specification. Validation runs in a fixed order so the
//! reported kind is stable for a given definition:
//!
//! 1. the flow has steps and every step has code
//! 2. step ids are well formed and unique, also after template-name derivation
//! 3. every edge endpoint names an existing step
//! 4. the graph is acyclic (self-loops included)
//!
//! Nothing is ever dropped to make a definition valid; the first violation
//! rejects the whole flow and no partial job is returned.

use super::script_builder::{is_valid_step_id, ScriptInput, StepScriptBuilder};
use crate::config::EngineConfig;
use crate::constants::job;
use crate::engine::{
    template_name_for, DagTask, JobMetadata, JobSpec, MultiStepDagJob, ScriptTemplate,
    SharedVolume, SingleStepJob,
};
use crate::error::{ValidationError, ValidationErrorKind};
use crate::models::{DependencySnapshot, Edge, Step};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Settings baked into every generated template
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerOptions {
    pub image: String,
    pub volume_size: String,
    pub service_account: Option<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for CompilerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            image: config.image.clone(),
            volume_size: config.volume_size.clone(),
            service_account: config.service_account.clone(),
        }
    }
}

/// A definition that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedGraph {
    /// Step ids in execution order
    pub order: Vec<String>,
    /// Step id to its direct predecessors, in edge declaration order
    pub predecessors: BTreeMap<String, Vec<String>>,
}

impl ValidatedGraph {
    pub fn predecessors_of(&self, step_id: &str) -> &[String] {
        self.predecessors
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFlow {
    pub spec: JobSpec,
    pub graph: ValidatedGraph,
}

#[derive(Debug, Clone, Default)]
pub struct DagCompiler {
    options: CompilerOptions,
    scripts: StepScriptBuilder,
}

impl DagCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self {
            options,
            scripts: StepScriptBuilder::default(),
        }
    }

    pub fn with_script_builder(mut self, scripts: StepScriptBuilder) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Check a step graph without building anything.
    pub fn validate(steps: &[Step], edges: &[Edge]) -> Result<ValidatedGraph, ValidationError> {
        ensure_has_steps(steps)?;
        validate_step_ids(steps)?;
        validate_edge_endpoints(steps, edges)?;
        let order = topological_order(steps, edges)?;

        let mut predecessors: BTreeMap<String, Vec<String>> = steps
            .iter()
            .map(|s| (s.step_id.clone(), Vec::new()))
            .collect();
        for edge in edges {
            if let Some(preds) = predecessors.get_mut(&edge.target) {
                if !preds.contains(&edge.source) {
                    preds.push(edge.source.clone());
                }
            }
        }

        Ok(ValidatedGraph {
            order,
            predecessors,
        })
    }

    /// Build the submittable multi-step job for a flow.
    pub fn compile(&self, steps: &[Step], edges: &[Edge]) -> Result<CompiledFlow, ValidationError> {
        let graph = Self::validate(steps, edges)?;
        let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.step_id.as_str(), s)).collect();

        let mut templates = Vec::with_capacity(graph.order.len());
        let mut tasks = Vec::with_capacity(graph.order.len());

        for step_id in &graph.order {
            let Some(step) = by_id.get(step_id.as_str()) else {
                continue;
            };
            let predecessors = graph.predecessors_of(step_id);
            let script = self.scripts.build(&ScriptInput::from(*step), predecessors)?;
            let name = template_name_for(step_id);

            templates.push(ScriptTemplate {
                name: name.clone(),
                step_id: step_id.clone(),
                image: self.options.image.clone(),
                script,
                mounts_shared_volume: true,
            });
            tasks.push(DagTask {
                name: name.clone(),
                template: name,
                dependencies: predecessors.iter().map(|p| template_name_for(p)).collect(),
            });
        }

        debug!(
            steps = steps.len(),
            edges = edges.len(),
            "Compiled flow into multi-step job"
        );

        let spec = JobSpec::MultiStepDag(MultiStepDagJob {
            metadata: self.metadata("flow-"),
            volume: SharedVolume::with_size(self.options.volume_size.clone()),
            templates,
            tasks,
        });

        Ok(CompiledFlow { spec, graph })
    }

    /// Render the engine manifest a flow would be submitted as. Pure: nothing is submitted.
    pub fn preview(&self, steps: &[Step], edges: &[Edge]) -> Result<Value, ValidationError> {
        Ok(self.compile(steps, edges)?.spec.to_manifest())
    }

    /// Build the single-step job for a task run.
    pub fn compile_task(&self, snapshot: &DependencySnapshot) -> Result<JobSpec, ValidationError> {
        if snapshot.code.trim().is_empty() {
            return Err(ValidationError::empty_code("task"));
        }
        let input = ScriptInput::from_snapshot(job::SINGLE_STEP_ID, snapshot);
        let script = self.scripts.build(&input, &[])?;

        Ok(JobSpec::SingleStep(SingleStepJob {
            metadata: self.metadata("task-"),
            template: ScriptTemplate {
                name: job::ENTRYPOINT.to_string(),
                step_id: job::SINGLE_STEP_ID.to_string(),
                image: self.options.image.clone(),
                script,
                mounts_shared_volume: false,
            },
        }))
    }

    fn metadata(&self, generate_name: &str) -> JobMetadata {
        JobMetadata {
            generate_name: generate_name.to_string(),
            labels: BTreeMap::new(),
            service_account: self.options.service_account.clone(),
        }
    }
}

fn ensure_has_steps(steps: &[Step]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::new(
            ValidationErrorKind::EmptyFlow,
            "flow must contain at least one step",
        ));
    }
    for step in steps {
        if step.code.trim().is_empty() {
            return Err(ValidationError::empty_code(&format!("step '{}'", step.step_id)));
        }
    }
    Ok(())
}

fn validate_step_ids(steps: &[Step]) -> Result<(), ValidationError> {
    let mut seen_ids = HashSet::new();
    let mut seen_templates: HashMap<String, &str> = HashMap::new();

    for step in steps {
        let id = step.step_id.as_str();
        if !is_valid_step_id(id) {
            return Err(ValidationError::new(
                ValidationErrorKind::InvalidStepId,
                format!("step id '{id}' must match [A-Za-z0-9_-]+"),
            ));
        }
        if !seen_ids.insert(id) {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateStepId,
                format!("step id '{id}' is used more than once"),
            ));
        }
        if let Some(other) = seen_templates.insert(template_name_for(id), id) {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateStepId,
                format!("step ids '{other}' and '{id}' map to the same engine template"),
            ));
        }
    }
    Ok(())
}

fn validate_edge_endpoints(steps: &[Step], edges: &[Edge]) -> Result<(), ValidationError> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();

    for edge in edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                return Err(ValidationError::unknown_step(
                    &edge.source,
                    &edge.target,
                    endpoint,
                ));
            }
        }
    }
    Ok(())
}

fn topological_order(steps: &[Step], edges: &[Edge]) -> Result<Vec<String>, ValidationError> {
    // Edge direction: source -> target, so a predecessor sorts first
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for step in steps {
        graph.add_node(step.step_id.as_str());
    }
    for edge in edges {
        if edge.source == edge.target {
            return Err(ValidationError::cycle(&edge.source));
        }
        graph.add_edge(edge.source.as_str(), edge.target.as_str(), ());
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(ValidationError::cycle(cycle.node_id())),
    }
}
