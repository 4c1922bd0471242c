//! # Argo Engine Client
//!
//! HTTP client for an Argo-Workflows-compatible server. Only `Pod` nodes are
//! reported as sub-units; DAG and step-group nodes carry no logs.

use super::{
    EngineError, EnginePhase, EngineResult, EngineStatus, ExecutionEngine, JobSpec, SubUnitStatus,
};
use crate::config::EngineConfig;
use crate::constants::job;
use crate::logging::log_engine_operation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ArgoEngineClient {
    client: Client,
    base_url: String,
    namespace: String,
    auth_token: Option<String>,
}

impl ArgoEngineClient {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn workflows_url(&self) -> String {
        format!("{}/api/v1/workflows/{}", self.base_url, self.namespace)
    }

    fn workflow_url(&self, name: &str) -> String {
        format!("{}/{}", self.workflows_url(), name)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> EngineResult<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

async fn error_for_status(response: Response) -> EngineError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    EngineError::Http { status, body }
}

#[derive(Debug, Deserialize)]
struct WorkflowResponse {
    metadata: WorkflowMetadata,
    #[serde(default)]
    status: Option<WorkflowStatus>,
}

#[derive(Debug, Deserialize)]
struct WorkflowMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    nodes: HashMap<String, WorkflowNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowNode {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(rename = "type", default)]
    node_type: String,
    #[serde(default)]
    template_name: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogLine {
    result: Option<LogLineResult>,
}

#[derive(Debug, Deserialize)]
struct LogLineResult {
    #[serde(default)]
    content: String,
}

/// Pod name for a node: `<workflow>-<template>-<hash>` where the node id is `<workflow>-<hash>`.
/// A workflow whose only pod is the root node uses the workflow name.
pub fn pod_name_for(workflow: &str, template: &str, node_id: &str) -> String {
    if node_id == workflow {
        return workflow.to_string();
    }
    match node_id
        .strip_prefix(workflow)
        .and_then(|rest| rest.strip_prefix('-'))
    {
        Some(hash) if !template.is_empty() => format!("{workflow}-{template}-{hash}"),
        _ => node_id.to_string(),
    }
}

impl WorkflowResponse {
    fn into_status(self) -> EngineStatus {
        let workflow = self.metadata.name;
        let status = self.status.unwrap_or_default();

        let mut sub_units: Vec<SubUnitStatus> = status
            .nodes
            .into_values()
            .filter(|node| node.node_type == "Pod")
            .map(|node| {
                let template = node.template_name.unwrap_or_default();
                let name = if template.is_empty() {
                    node.display_name.unwrap_or_default()
                } else {
                    template
                };
                let phase = EnginePhase::parse(node.phase.as_deref().unwrap_or_default());
                let pod_name = phase
                    .has_started()
                    .then(|| pod_name_for(&workflow, &name, &node.id));
                SubUnitStatus {
                    id: node.id,
                    name,
                    phase,
                    pod_name,
                    started_at: node.started_at,
                    finished_at: node.finished_at,
                    message: node.message,
                }
            })
            .collect();
        sub_units.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));

        EngineStatus {
            phase: EnginePhase::parse(status.phase.as_deref().unwrap_or_default()),
            started_at: status.started_at,
            finished_at: status.finished_at,
            message: status.message,
            sub_units,
        }
    }
}

#[async_trait]
impl ExecutionEngine for ArgoEngineClient {
    async fn submit(&self, spec: &JobSpec) -> EngineResult<String> {
        let body = serde_json::json!({ "workflow": spec.to_manifest() });
        debug!(kind = spec.kind(), url = %self.workflows_url(), "Submitting workflow");

        let response = self
            .send(self.client.post(self.workflows_url()).json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let created: WorkflowResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        log_engine_operation("submit", Some(&created.metadata.name), "submitted", None);
        Ok(created.metadata.name)
    }

    async fn get_status(&self, external_job_id: &str) -> EngineResult<Option<EngineStatus>> {
        let response = self
            .send(self.client.get(self.workflow_url(external_job_id)))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(external_job_id, "Workflow not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let workflow: WorkflowResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        Ok(Some(workflow.into_status()))
    }

    async fn get_logs(&self, external_job_id: &str, sub_unit_id: &str) -> EngineResult<String> {
        let url = format!("{}/log", self.workflow_url(external_job_id));
        let request = self.client.get(url).query(&[
            ("podName", sub_unit_id),
            ("logOptions.container", job::MAIN_CONTAINER),
        ]);

        let response = self.send(request).await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                return Err(EngineError::LogsUnavailable(sub_unit_id.to_string()));
            }
            _ => return Err(error_for_status(response).await),
        }

        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        // Newline-delimited JSON, one log line per entry
        let mut text = String::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogLine>(line) {
                Ok(LogLine {
                    result: Some(result),
                }) => {
                    text.push_str(&result.content);
                    text.push('\n');
                }
                Ok(LogLine { result: None }) => {}
                Err(e) => {
                    warn!(external_job_id, sub_unit_id, error = %e, "Skipping undecodable log line");
                }
            }
        }
        Ok(text)
    }

    async fn cancel(&self, external_job_id: &str) -> EngineResult<()> {
        let url = format!("{}/stop", self.workflow_url(external_job_id));
        let response = self
            .send(self.client.put(url).json(&serde_json::json!({})))
            .await?;

        match response.status() {
            status if status.is_success() => {
                log_engine_operation("cancel", Some(external_job_id), "stop_requested", None);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                log_engine_operation("cancel", Some(external_job_id), "not_found", None);
                Ok(())
            }
            _ => Err(error_for_status(response).await),
        }
    }
}
