//! In-process [`ExecutionEngine`] with scripted job status and call counters.
//!
//! Submitted jobs start `Pending` with no sub-units. Tests move them along
//! with [`MockEngine::set_job_phase`] and attach log text per template with
//! [`MockEngine::set_logs`].

use crate::engine::{
    EngineError, EnginePhase, EngineResult, EngineStatus, ExecutionEngine, JobSpec, SubUnitStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
struct MockState {
    jobs: HashMap<String, EngineStatus>,
    /// Keyed by sub-unit log source
    logs: HashMap<String, String>,
    submitted: Vec<JobSpec>,
}

#[derive(Debug)]
pub struct MockEngine {
    state: Mutex<MockState>,
    unavailable: AtomicBool,
    stop_on_cancel: AtomicBool,
    next_job: AtomicUsize,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    log_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    submit_gate: Mutex<Option<Arc<Semaphore>>>,
    log_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Sub-unit id (and pod name) the mock assigns to a template of a job
pub fn sub_unit_id(job_id: &str, template: &str) -> String {
    format!("{job_id}-{template}")
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            unavailable: AtomicBool::new(false),
            stop_on_cancel: AtomicBool::new(true),
            next_job: AtomicUsize::new(1),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            submit_gate: Mutex::new(None),
            log_gate: Mutex::new(None),
        }
    }

    /// Park every `submit` until a permit is added to the returned semaphore
    pub fn hold_submissions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.submit_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Park every `get_logs` until a permit is added to the returned semaphore
    pub fn hold_log_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.log_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    async fn pass(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().clone();
        if let Some(gate) = gate {
            // the permit returns on drop, so one permit releases every waiter in turn
            let _permit = gate.acquire().await;
        }
    }

    /// Every call fails with a transport error while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether `cancel` stops the job (the default) or is silently ignored
    pub fn set_stop_on_cancel(&self, stop: bool) {
        self.stop_on_cancel.store(stop, Ordering::SeqCst);
    }

    /// Replace a job's phase and sub-units. Sub-units are `(template, phase)` pairs.
    pub fn set_job_phase(&self, job_id: &str, phase: EnginePhase, units: &[(&str, EnginePhase)]) {
        let now = Utc::now();
        let sub_units = units
            .iter()
            .map(|(template, unit_phase)| {
                let id = sub_unit_id(job_id, template);
                SubUnitStatus {
                    pod_name: unit_phase.has_started().then(|| id.clone()),
                    id,
                    name: template.to_string(),
                    phase: *unit_phase,
                    started_at: unit_phase.has_started().then_some(now),
                    finished_at: unit_phase.is_finished().then_some(now),
                    message: unit_phase
                        .is_failure()
                        .then(|| "Error (exit code 1)".to_string()),
                }
            })
            .collect();

        self.set_status(
            job_id,
            EngineStatus {
                phase,
                started_at: Some(now),
                finished_at: phase.is_finished().then_some(now),
                message: None,
                sub_units,
            },
        );
    }

    pub fn set_status(&self, job_id: &str, status: EngineStatus) {
        self.state.lock().jobs.insert(job_id.to_string(), status);
    }

    /// Forget a job, as if it expired on the engine side
    pub fn remove_job(&self, job_id: &str) {
        self.state.lock().jobs.remove(job_id);
    }

    pub fn has_job(&self, job_id: &str) -> bool {
        self.state.lock().jobs.contains_key(job_id)
    }

    /// Set the full log text of a template's sub-unit
    pub fn set_logs(&self, job_id: &str, template: &str, content: impl Into<String>) {
        self.state
            .lock()
            .logs
            .insert(sub_unit_id(job_id, template), content.into());
    }

    pub fn submitted_specs(&self) -> Vec<JobSpec> {
        self.state.lock().submitted.clone()
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionEngine for MockEngine {
    async fn submit(&self, spec: &JobSpec) -> EngineResult<String> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        Self::pass(&self.submit_gate).await;
        self.check_available()?;

        let number = self.next_job.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("{}{number:05}", spec.metadata().generate_name);

        let mut state = self.state.lock();
        state.submitted.push(spec.clone());
        state.jobs.insert(
            job_id.clone(),
            EngineStatus {
                phase: EnginePhase::Pending,
                started_at: None,
                finished_at: None,
                message: None,
                sub_units: Vec::new(),
            },
        );
        Ok(job_id)
    }

    async fn get_status(&self, external_job_id: &str) -> EngineResult<Option<EngineStatus>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.state.lock().jobs.get(external_job_id).cloned())
    }

    async fn get_logs(&self, external_job_id: &str, sub_unit_id: &str) -> EngineResult<String> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        Self::pass(&self.log_gate).await;
        self.check_available()?;

        let state = self.state.lock();
        let scheduled = state
            .jobs
            .get(external_job_id)
            .map(|job| {
                job.sub_units
                    .iter()
                    .any(|u| u.log_source() == sub_unit_id && u.pod_name.is_some())
            })
            .unwrap_or(false);
        if !scheduled {
            return Err(EngineError::LogsUnavailable(sub_unit_id.to_string()));
        }
        Ok(state.logs.get(sub_unit_id).cloned().unwrap_or_default())
    }

    async fn cancel(&self, external_job_id: &str) -> EngineResult<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        if !self.stop_on_cancel.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(external_job_id) {
            if !job.phase.is_finished() {
                let now = Utc::now();
                job.phase = EnginePhase::Failed;
                job.finished_at = Some(now);
                job.message = Some("Stopped with strategy 'Stop'".to_string());
                for unit in job.sub_units.iter_mut().filter(|u| !u.phase.is_finished()) {
                    unit.phase = EnginePhase::Failed;
                    unit.finished_at = Some(now);
                    unit.message = Some("Stopped with strategy 'Stop'".to_string());
                }
            }
        }
        Ok(())
    }
}
