//! # Log Sync Engine
//!
//! Serves run logs from the persisted log cache, filling it from the engine
//! when needed. Two access patterns share one write-through path:
//!
//! - [`LogSyncEngine::get_logs`]: point-in-time read. Cached records always
//!   win, even when incomplete; only an empty cache triggers an engine fetch,
//!   and concurrent callers for the same run share that single fetch.
//! - [`LogSyncEngine::stream_logs`]: live subscription. One poll loop per run
//!   refreshes the cache on every tick and pushes a [`LogUpdate::Snapshot`]
//!   whenever the total log length grows or a step's phase changes. Once the
//!   stored run phase is terminal the loop does one final refresh, pushes
//!   [`LogUpdate::Completed`] and closes. Extra subscribers join the existing
//!   loop; when the last one leaves, the loop stops.
//!
//! Runs whose cached records are all terminal are served from the store
//! without asking the engine again.

use crate::config::LogSyncConfig;
use crate::constants::{job, operations};
use crate::engine::{template_name_for, EngineError, ExecutionEngine};
use crate::error::{FlowrunError, Result};
use crate::logging::log_run_operation;
use crate::models::{total_bytes, LogEntry, LogRecord, RunHandle, RunKind};
use crate::orchestration::phase_resolver::{latest_sub_unit, sub_unit_phase};
use crate::state_machine::RunPhase;
use crate::store::RunStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One message on a log stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogUpdate {
    /// Full current log state of the run
    Snapshot {
        run_id: Uuid,
        run_phase: RunPhase,
        entries: Vec<LogEntry>,
        total_bytes: usize,
    },
    /// The engine could not be reached and nothing is cached yet
    StatusUnknown { run_id: Uuid, reason: String },
    /// The run reached a terminal phase; no further updates follow
    Completed { run_id: Uuid, phase: RunPhase },
}

impl LogUpdate {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Snapshot { run_id, .. }
            | Self::StatusUnknown { run_id, .. }
            | Self::Completed { run_id, .. } => *run_id,
        }
    }
}

/// Receiving end of a log stream
#[derive(Debug)]
pub struct LogSubscription {
    run_id: Uuid,
    receiver: broadcast::Receiver<LogUpdate>,
    /// Latest snapshot of the stream at the time this subscriber joined
    pending: Option<LogUpdate>,
}

impl LogSubscription {
    pub(crate) fn new(
        run_id: Uuid,
        receiver: broadcast::Receiver<LogUpdate>,
        pending: Option<LogUpdate>,
    ) -> Self {
        Self {
            run_id,
            receiver,
            pending,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next update, or `None` once the stream has closed.
    ///
    /// A subscriber that falls behind skips to newer updates; every snapshot
    /// carries the full log state so nothing is lost by skipping.
    pub async fn recv(&mut self) -> Option<LogUpdate> {
        if let Some(update) = self.pending.take() {
            return Some(update);
        }
        loop {
            match self.receiver.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(run_id = %self.run_id, skipped, "Log subscriber lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug)]
struct ActiveStream {
    sender: broadcast::Sender<LogUpdate>,
    latest: Option<LogUpdate>,
}

/// What a pushed snapshot showed, for change detection
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    run_phase: RunPhase,
    total_bytes: usize,
    step_phases: Vec<(String, RunPhase)>,
}

impl Fingerprint {
    fn of(run_phase: RunPhase, records: &[LogRecord]) -> Self {
        Self {
            run_phase,
            total_bytes: total_bytes(records),
            step_phases: records
                .iter()
                .map(|r| (r.step_id.clone(), r.phase))
                .collect(),
        }
    }
}

#[derive(Clone)]
pub struct LogSyncEngine {
    store: Arc<dyn RunStore>,
    engine: Arc<dyn ExecutionEngine>,
    config: LogSyncConfig,
    fetch_locks: Arc<DashMap<Uuid, Arc<AsyncMutex<()>>>>,
    streams: Arc<DashMap<Uuid, ActiveStream>>,
}

impl std::fmt::Debug for LogSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSyncEngine")
            .field("config", &self.config)
            .field("active_streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl LogSyncEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        engine: Arc<dyn ExecutionEngine>,
        config: LogSyncConfig,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            fetch_locks: Arc::new(DashMap::new()),
            streams: Arc::new(DashMap::new()),
        }
    }

    /// Number of runs with a live poll loop
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Point-in-time logs of every step of a run, ordered by step id.
    pub async fn get_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>> {
        let run = self.require_run(run_id).await?;

        let cached = self.store.get_log_records(run_id).await?;
        if !cached.is_empty() {
            return Ok(into_entries(cached));
        }

        let lock = self.fetch_lock(run_id);
        let records = {
            let _guard = lock.lock().await;
            // another caller may have filled the cache while we waited
            let cached = self.store.get_log_records(run_id).await?;
            if cached.is_empty() {
                self.sync_from_engine(&run).await
            } else {
                Ok(cached)
            }
        };
        drop(lock);
        self.release_fetch_lock(run_id);

        Ok(into_entries(records?))
    }

    /// Subscribe to live log updates of a run.
    pub async fn stream_logs(&self, run_id: Uuid) -> Result<LogSubscription> {
        self.require_run(run_id).await?;

        let (subscription, new_loop) = match self.streams.entry(run_id) {
            Entry::Occupied(entry) => {
                let stream = entry.get();
                let subscription =
                    LogSubscription::new(run_id, stream.sender.subscribe(), stream.latest.clone());
                (subscription, None)
            }
            Entry::Vacant(entry) => {
                let (sender, receiver) = broadcast::channel(self.config.channel_capacity.max(1));
                entry.insert(ActiveStream {
                    sender: sender.clone(),
                    latest: None,
                });
                (LogSubscription::new(run_id, receiver, None), Some(sender))
            }
        };

        if let Some(sender) = new_loop {
            let this = self.clone();
            tokio::spawn(async move { this.poll_loop(run_id, sender).await });
            info!(%run_id, "📡 Log stream started");
        } else {
            debug!(%run_id, "Joined existing log stream");
        }

        Ok(subscription)
    }

    async fn poll_loop(self, run_id: Uuid, sender: broadcast::Sender<LogUpdate>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_sent: Option<Fingerprint> = None;
        let mut reported_unknown = false;

        loop {
            ticker.tick().await;

            if self
                .streams
                .remove_if(&run_id, |_, s| s.sender.receiver_count() == 0)
                .is_some()
            {
                debug!(%run_id, "Last log subscriber left; stream stopped");
                return;
            }

            match self.poll_once(run_id).await {
                Ok((run_phase, records)) => {
                    reported_unknown = false;
                    let fingerprint = Fingerprint::of(run_phase, &records);
                    if last_sent.as_ref() != Some(&fingerprint) {
                        let update = LogUpdate::Snapshot {
                            run_id,
                            run_phase,
                            total_bytes: fingerprint.total_bytes,
                            entries: into_entries(records),
                        };
                        self.publish(run_id, &sender, update);
                        last_sent = Some(fingerprint);
                    }

                    if run_phase.is_terminal() {
                        self.streams.remove(&run_id);
                        let _ = sender.send(LogUpdate::Completed {
                            run_id,
                            phase: run_phase,
                        });
                        log_run_operation(
                            operations::STREAM_LOGS,
                            run_id,
                            None,
                            run_phase.as_str(),
                            Some("stream completed"),
                        );
                        return;
                    }
                }
                Err(FlowrunError::NotFound { .. }) => {
                    debug!(%run_id, "Run deleted; closing log stream");
                    self.streams.remove(&run_id);
                    return;
                }
                Err(e) => {
                    warn!(%run_id, error = %e, "Log poll failed; retrying next tick");
                    if last_sent.is_none() && !reported_unknown {
                        let _ = sender.send(LogUpdate::StatusUnknown {
                            run_id,
                            reason: e.to_string(),
                        });
                        reported_unknown = true;
                    }
                }
            }
        }
    }

    /// Send while holding the stream entry so late joiners see either the
    /// update itself or its successor.
    fn publish(&self, run_id: Uuid, sender: &broadcast::Sender<LogUpdate>, update: LogUpdate) {
        match self.streams.get_mut(&run_id) {
            Some(mut stream) => {
                stream.latest = Some(update.clone());
                let _ = stream.sender.send(update);
            }
            None => {
                let _ = sender.send(update);
            }
        }
    }

    async fn poll_once(&self, run_id: Uuid) -> Result<(RunPhase, Vec<LogRecord>)> {
        let run = self.require_run(run_id).await?;
        let cached = self.store.get_log_records(run_id).await?;

        let settled = run.phase.is_terminal()
            && !cached.is_empty()
            && cached.iter().all(|r| r.phase.is_terminal());
        if settled {
            return Ok((run.phase, cached));
        }

        let lock = self.fetch_lock(run_id);
        let result = {
            let _guard = lock.lock().await;
            self.sync_from_engine(&run).await
        };
        drop(lock);
        self.release_fetch_lock(run_id);

        match result {
            Ok(records) => Ok((run.phase, records)),
            Err(e) if e.is_transient() && !cached.is_empty() => {
                debug!(%run_id, error = %e, "Engine unreachable; serving cached logs");
                Ok((run.phase, cached))
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch live logs, merge them into the cache and return the cached records.
    async fn sync_from_engine(&self, run: &RunHandle) -> Result<Vec<LogRecord>> {
        if let Some(records) = self.fetch_live(run).await? {
            for record in &records {
                self.store.upsert_log_record(record).await?;
            }
            debug!(
                run_id = %run.run_id,
                operation = operations::FETCH_LOGS,
                steps = records.len(),
                bytes = total_bytes(&records),
                "Log cache refreshed"
            );
        }
        if run.phase.is_terminal() {
            self.settle_missing_steps(run).await?;
        }
        self.store.get_log_records(run.run_id).await
    }

    /// Cache an empty terminal record for every step of a finished run that
    /// produced no logs (job expired, step never scheduled), so later reads of
    /// the run are served from the store alone.
    async fn settle_missing_steps(&self, run: &RunHandle) -> Result<()> {
        let cached = self.store.get_log_records(run.run_id).await?;
        let steps: Vec<(String, RunPhase)> = match run.kind {
            RunKind::Task => vec![(job::SINGLE_STEP_ID.to_string(), run.phase)],
            RunKind::Flow => self
                .store
                .list_flow_step_runs(run.run_id)
                .await?
                .into_iter()
                .map(|s| {
                    let phase = if s.phase.is_terminal() { s.phase } else { run.phase };
                    (s.step_id, phase)
                })
                .collect(),
        };

        for (step_id, phase) in steps {
            if cached.iter().any(|r| r.step_id == step_id) {
                continue;
            }
            self.store
                .upsert_log_record(&LogRecord::new(run.run_id, step_id, "", "", phase))
                .await?;
        }
        Ok(())
    }

    /// Logs of every scheduled step, or `None` when the engine has no job to ask about.
    async fn fetch_live(&self, run: &RunHandle) -> Result<Option<Vec<LogRecord>>> {
        let Some(job_id) = run.external_job_id.as_deref() else {
            return Ok(None);
        };
        let Some(status) = self.engine.get_status(job_id).await? else {
            debug!(run_id = %run.run_id, job_id, "Job unknown to engine; nothing to cache");
            return Ok(None);
        };

        let steps = self.step_templates(run).await?;
        let fetches = steps.iter().filter_map(|(step_id, template)| {
            let unit = latest_sub_unit(&status, template)?;
            // unscheduled units have no pod and no logs yet
            unit.pod_name.as_ref()?;
            Some(async move {
                match self.engine.get_logs(job_id, unit.log_source()).await {
                    Ok(content) => Ok(Some(LogRecord::new(
                        run.run_id,
                        step_id.as_str(),
                        unit.log_source(),
                        content,
                        sub_unit_phase(unit.phase),
                    ))),
                    Err(EngineError::LogsUnavailable(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
        });

        let records = try_join_all(fetches).await?;
        Ok(Some(records.into_iter().flatten().collect()))
    }

    /// `(step id, engine template)` pairs of a run
    async fn step_templates(&self, run: &RunHandle) -> Result<Vec<(String, String)>> {
        match run.kind {
            RunKind::Task => Ok(vec![(
                job::SINGLE_STEP_ID.to_string(),
                job::ENTRYPOINT.to_string(),
            )]),
            RunKind::Flow => {
                let flow_run = self
                    .store
                    .get_flow_run(run.run_id)
                    .await?
                    .ok_or_else(|| FlowrunError::not_found("flow_run", run.run_id))?;
                Ok(flow_run
                    .snapshot
                    .steps
                    .iter()
                    .map(|s| (s.step_id.clone(), template_name_for(&s.step_id)))
                    .collect())
            }
        }
    }

    async fn require_run(&self, run_id: Uuid) -> Result<RunHandle> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowrunError::not_found("run", run_id))
    }

    fn fetch_lock(&self, run_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.fetch_locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release_fetch_lock(&self, run_id: Uuid) {
        self.fetch_locks
            .remove_if(&run_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn into_entries(records: Vec<LogRecord>) -> Vec<LogEntry> {
    records.into_iter().map(LogEntry::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::DagCompiler;
    use crate::engine::EnginePhase;
    use crate::models::{RunOverrides, TaskDefinition, TaskRun};
    use crate::orchestration::RunLifecycleTracker;
    use crate::store::InMemoryRunStore;
    use crate::test_helpers::MockEngine;
    use std::time::Duration;

    struct Setup {
        store: Arc<InMemoryRunStore>,
        engine: Arc<MockEngine>,
        tracker: RunLifecycleTracker,
        logs: LogSyncEngine,
    }

    fn setup() -> Setup {
        let store = Arc::new(InMemoryRunStore::new());
        let engine = Arc::new(MockEngine::new());
        let tracker = RunLifecycleTracker::new(
            store.clone(),
            engine.clone(),
            DagCompiler::default(),
            Duration::from_secs(60),
        );
        let logs = LogSyncEngine::new(store.clone(), engine.clone(), LogSyncConfig::default());
        Setup {
            store,
            engine,
            tracker,
            logs,
        }
    }

    async fn submitted_task(setup: &Setup) -> (TaskRun, String) {
        let task = setup
            .store
            .create_task(&TaskDefinition::new("sum", "print(1+1)"))
            .await
            .unwrap();
        let run = setup
            .tracker
            .submit_task(task.task_id, &RunOverrides::none())
            .await
            .unwrap();
        let job_id = run.external_job_id.clone().unwrap();
        (run, job_id)
    }

    #[tokio::test]
    async fn test_terminal_run_fetches_from_engine_once() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup
            .engine
            .set_job_phase(&job_id, EnginePhase::Succeeded, &[("main", EnginePhase::Succeeded)]);
        setup.engine.set_logs(&job_id, "main", "2\n");
        setup.tracker.reconcile(run.task_run_id).await.unwrap();

        let first = setup.logs.get_logs(run.task_run_id).await.unwrap();
        let second = setup.logs.get_logs(run.task_run_id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].step_id, "main");
        assert_eq!(first[0].content, "2\n");
        assert_eq!(first[0].phase, RunPhase::Succeeded);
        assert_eq!(setup.engine.log_calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_record_wins_even_if_incomplete() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup
            .store
            .upsert_log_record(&LogRecord::new(
                run.task_run_id,
                "main",
                "pod-a",
                "partial",
                RunPhase::Running,
            ))
            .await
            .unwrap();
        setup.engine.set_logs(&job_id, "main", "partial and more");

        let entries = setup.logs.get_logs(run.task_run_id).await.unwrap();
        assert_eq!(entries[0].content, "partial");
        assert_eq!(setup.engine.status_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_job_writes_nothing() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup.engine.remove_job(&job_id);

        let entries = setup.logs.get_logs(run.task_run_id).await.unwrap();
        assert!(entries.is_empty());
        assert!(setup
            .store
            .get_log_records(run.task_run_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_expired_job_of_finished_run_is_asked_once() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup
            .engine
            .set_job_phase(&job_id, EnginePhase::Succeeded, &[("main", EnginePhase::Succeeded)]);
        setup.tracker.reconcile(run.task_run_id).await.unwrap();
        setup.engine.remove_job(&job_id);
        let calls_before = setup.engine.status_calls();

        let first = setup.logs.get_logs(run.task_run_id).await.unwrap();
        let second = setup.logs.get_logs(run.task_run_id).await.unwrap();

        assert_eq!(setup.engine.status_calls() - calls_before, 1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].content, "");
        assert_eq!(first[0].phase, RunPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_unscheduled_step_is_skipped() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup
            .engine
            .set_job_phase(&job_id, EnginePhase::Pending, &[("main", EnginePhase::Pending)]);

        let entries = setup.logs.get_logs(run.task_run_id).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(setup.engine.log_calls(), 0);
    }

    #[tokio::test]
    async fn test_get_logs_unknown_run_is_not_found() {
        let setup = setup();
        let err = setup.logs.get_logs(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FlowrunError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_pushes_growth_then_completes() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup
            .engine
            .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
        setup.engine.set_logs(&job_id, "main", "starting\n");

        let mut subscription = setup.logs.stream_logs(run.task_run_id).await.unwrap();
        let Some(LogUpdate::Snapshot { total_bytes, .. }) = subscription.recv().await else {
            panic!("expected an initial snapshot");
        };
        assert_eq!(total_bytes, "starting\n".len());

        setup.engine.set_logs(&job_id, "main", "starting\n2\n");
        let Some(LogUpdate::Snapshot { entries, .. }) = subscription.recv().await else {
            panic!("expected a snapshot after growth");
        };
        assert_eq!(entries[0].content, "starting\n2\n");

        setup
            .engine
            .set_job_phase(&job_id, EnginePhase::Succeeded, &[("main", EnginePhase::Succeeded)]);
        setup.tracker.reconcile(run.task_run_id).await.unwrap();

        let Some(LogUpdate::Snapshot { run_phase, entries, .. }) = subscription.recv().await else {
            panic!("expected a final snapshot");
        };
        assert_eq!(run_phase, RunPhase::Succeeded);
        assert_eq!(entries[0].phase, RunPhase::Succeeded);
        assert_eq!(
            subscription.recv().await,
            Some(LogUpdate::Completed {
                run_id: run.task_run_id,
                phase: RunPhase::Succeeded
            })
        );
        assert_eq!(subscription.recv().await, None);
        assert_eq!(setup.logs.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_share_one_loop() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup
            .engine
            .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);
        setup.engine.set_logs(&job_id, "main", "x\n");

        let mut first = setup.logs.stream_logs(run.task_run_id).await.unwrap();
        assert!(matches!(first.recv().await, Some(LogUpdate::Snapshot { .. })));

        let mut second = setup.logs.stream_logs(run.task_run_id).await.unwrap();
        assert_eq!(setup.logs.active_streams(), 1);
        // the late joiner starts from the latest snapshot
        let Some(LogUpdate::Snapshot { total_bytes, .. }) = second.recv().await else {
            panic!("expected the latest snapshot");
        };
        assert_eq!(total_bytes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_stops_when_subscribers_leave() {
        let setup = setup();
        let (run, job_id) = submitted_task(&setup).await;
        setup
            .engine
            .set_job_phase(&job_id, EnginePhase::Running, &[("main", EnginePhase::Running)]);

        let mut subscription = setup.logs.stream_logs(run.task_run_id).await.unwrap();
        subscription.recv().await;
        drop(subscription);

        for _ in 0..5 {
            if setup.logs.active_streams() == 0 {
                break;
            }
            tokio::time::sleep(LogSyncConfig::default().poll_interval()).await;
        }
        assert_eq!(setup.logs.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_engine_without_cache_reports_unknown() {
        let setup = setup();
        let (run, _) = submitted_task(&setup).await;
        setup.engine.set_unavailable(true);

        let mut subscription = setup.logs.stream_logs(run.task_run_id).await.unwrap();
        let Some(LogUpdate::StatusUnknown { run_id, .. }) = subscription.recv().await else {
            panic!("expected a status-unknown signal");
        };
        assert_eq!(run_id, run.task_run_id);
    }
}
