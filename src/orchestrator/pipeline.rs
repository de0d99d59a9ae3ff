//! Ordered, fail-fast step execution against one session.
//!
//! A run first obtains a healthy worker; if that fails nothing else
//! happens. Each step is then persisted as running, executed, and persisted
//! as completed with its result, with a structured log entry and a
//! broadcast event at each edge. The first failing step ends the run and
//! its id, name, and error are stored on the execution.
//!
//! Runs against one session are serialized: a second run waits until the
//! first has released the worker, so its handshake probe and signal reset
//! never land in the middle of another run's task. Runs against different
//! sessions proceed in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, info_span, warn, Instrument};

use crate::broadcast::BroadcastHub;
use crate::collaborators::Collaborators;
use crate::config::GlobalConfig;
use crate::models::event::{BroadcastEvent, EventType};
use crate::models::execution::{Execution, ExecutionLogEntry, FailedStep, LogLevel, RunStatus};
use crate::models::session::SessionState;
use crate::orchestrator::session_manager::SessionManager;
use crate::persistence::db::Database;
use crate::persistence::execution_repo::ExecutionRepo;
use crate::persistence::work_item_repo::WorkItemRepo;
use crate::process::{BoxFuture, ProcessHandle};
use crate::signal::CompletionSignal;
use crate::storage::StorageHandle;
use crate::{AppError, Result};

/// Everything a step may touch.
#[derive(Clone)]
pub struct StepContext {
    /// Session the run targets.
    pub session_id: String,
    /// The session's healthy worker.
    pub handle: Arc<dyn ProcessHandle>,
    /// Session storage layout.
    pub storage: StorageHandle,
    /// Completion detection backend.
    pub signals: Arc<dyn CompletionSignal>,
    /// External services.
    pub collaborators: Arc<Collaborators>,
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Results of the steps that already ran, keyed by step id.
    pub previous: Map<String, Value>,
}

impl StepContext {
    /// Result of an earlier step.
    #[must_use]
    pub fn result_of(&self, step_id: &str) -> Option<&Value> {
        self.previous.get(step_id)
    }
}

type StepFn = Box<dyn FnOnce(StepContext) -> BoxFuture<'static, Result<Option<Value>>> + Send>;

/// One named unit of work.
pub struct Step {
    /// Stable identifier, recorded on failure.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Upper bound on the step's run time; exceeding it fails the step.
    pub timeout: Option<Duration>,
    run: StepFn,
}

impl Step {
    /// Build a step from an async closure.
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(StepContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            timeout: None,
            run: Box::new(move |ctx| Box::pin(run(ctx))),
        }
    }

    /// Bound the step's run time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PipelineResult {
    /// Persisted execution id.
    pub execution_id: String,
    /// `completed` or `failed`.
    pub status: RunStatus,
    /// Step results keyed by step id, on success.
    pub result: Option<Value>,
    /// Failure detail.
    pub error: Option<String>,
    /// Machine-checkable failure reason.
    pub reason: Option<String>,
    /// Step that aborted the run.
    pub failed_step: Option<FailedStep>,
}

impl PipelineResult {
    /// Whether the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Failure detail when the run failed because the worker itself broke.
    fn worker_broken(&self) -> Option<(&str, &str)> {
        let reason = self.reason.as_deref()?;
        matches!(reason, "process_error" | "handshake_failure")
            .then(|| (self.error.as_deref().unwrap_or(reason), reason))
    }
}

/// Runs step lists against sessions.
pub struct PipelineOrchestrator {
    sessions: Arc<SessionManager>,
    executions: ExecutionRepo,
    work_items: WorkItemRepo,
    hub: Arc<BroadcastHub>,
    signals: Arc<dyn CompletionSignal>,
    collaborators: Arc<Collaborators>,
    config: Arc<GlobalConfig>,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct Run<'a> {
    execution_id: String,
    session_id: &'a str,
    work_item_id: Option<&'a str>,
}

impl PipelineOrchestrator {
    /// Build an orchestrator over shared collaborators.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        sessions: Arc<SessionManager>,
        hub: Arc<BroadcastHub>,
        signals: Arc<dyn CompletionSignal>,
        collaborators: Arc<Collaborators>,
        config: Arc<GlobalConfig>,
    ) -> Self {
        Self {
            sessions,
            executions: ExecutionRepo::new(Arc::clone(&db)),
            work_items: WorkItemRepo::new(db),
            hub,
            signals,
            collaborators,
            config,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    fn run_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.to_owned()).or_default())
    }

    /// Completion backend used by steps.
    #[must_use]
    pub fn signals(&self) -> &Arc<dyn CompletionSignal> {
        &self.signals
    }

    /// Execute `steps` in order against `session_id`.
    ///
    /// Waits for any earlier run on the same session to finish first.
    /// Step failures, timeouts, and handshake failures are reported in the
    /// returned [`PipelineResult`], not as `Err`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if run bookkeeping cannot be persisted.
    pub async fn run(
        &self,
        session_id: &str,
        work_item_id: Option<&str>,
        steps: Vec<Step>,
    ) -> Result<PipelineResult> {
        let execution = Execution::new(session_id, work_item_id.map(str::to_owned));
        let span = info_span!("pipeline", session_id, execution_id = %execution.id);
        async move {
            let lock = self.run_lock(session_id);
            let _running = lock.lock().await;

            self.executions.create(&execution).await?;
            let run = Run {
                execution_id: execution.id,
                session_id,
                work_item_id,
            };

            let handle = match self.sessions.create_session(session_id).await {
                Ok(handle) => handle,
                Err(err) => return self.abort(&run, None, &err).await,
            };

            self.enter_processing(session_id).await?;
            let outcome = self.run_steps(&run, handle, steps).await;
            let broken = match &outcome {
                Ok(result) => result.worker_broken(),
                Err(_) => None,
            };
            self.leave_processing(session_id, broken).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_steps(
        &self,
        run: &Run<'_>,
        handle: Arc<dyn ProcessHandle>,
        steps: Vec<Step>,
    ) -> Result<PipelineResult> {
        let total = steps.len();
        let storage = self.sessions.storage(run.session_id);
        let mut previous = Map::new();

        for (index, step) in steps.into_iter().enumerate() {
            let position = u32::try_from(index).unwrap_or(u32::MAX);
            self.executions
                .start_step(&run.execution_id, position, &step.id, &step.name)
                .await?;
            info!(step_id = %step.id, step = %step.name, position, "step started");
            self.log(run, Some(&step.id), LogLevel::Info, "step started", json!({ "name": step.name }))
                .await;
            self.hub.broadcast(
                BroadcastEvent::new(run.session_id, EventType::StepStarted)
                    .with("execution_id", run.execution_id.as_str())
                    .with("step_id", step.id.as_str())
                    .with("name", step.name.as_str())
                    .with("position", position),
            );

            let ctx = StepContext {
                session_id: run.session_id.to_owned(),
                handle: Arc::clone(&handle),
                storage: storage.clone(),
                signals: Arc::clone(&self.signals),
                collaborators: Arc::clone(&self.collaborators),
                config: Arc::clone(&self.config),
                previous: previous.clone(),
            };
            let future = (step.run)(ctx);
            let outcome = match step.timeout {
                Some(limit) => tokio::time::timeout(limit, future).await.unwrap_or_else(|_| {
                    Err(AppError::SignalTimeout(format!(
                        "step exceeded its {limit:?} limit"
                    )))
                }),
                None => future.await,
            };

            match outcome {
                Ok(value) => {
                    self.executions
                        .complete_step(&run.execution_id, position, value.as_ref())
                        .await?;
                    let value = value.unwrap_or(Value::Null);
                    let percent = progress_percent(index + 1, total);
                    info!(step_id = %step.id, percent, "step completed");
                    self.log(run, Some(&step.id), LogLevel::Info, "step completed", json!({ "result": value }))
                        .await;
                    self.hub.broadcast(
                        BroadcastEvent::new(run.session_id, EventType::StepCompleted)
                            .with("execution_id", run.execution_id.as_str())
                            .with("step_id", step.id.as_str())
                            .with("name", step.name.as_str())
                            .with("position", position)
                            .with("progress", percent),
                    );
                    if let Some(item_id) = run.work_item_id {
                        if let Err(err) = self.work_items.update_progress(item_id, percent).await {
                            warn!(item_id, %err, "failed to record work item progress");
                        }
                    }
                    previous.insert(step.id, value);
                }
                Err(err) => {
                    self.executions
                        .fail_step(&run.execution_id, position, &err.to_string())
                        .await?;
                    let failed = FailedStep {
                        id: step.id,
                        name: step.name,
                    };
                    return self.abort(run, Some(failed), &err).await;
                }
            }
        }

        let result = Value::Object(previous);
        self.executions
            .complete(&run.execution_id, Some(&result))
            .await?;
        info!(steps = total, "pipeline completed");
        self.log(run, None, LogLevel::Info, "pipeline completed", json!({ "steps": total }))
            .await;
        self.hub.broadcast(
            BroadcastEvent::new(run.session_id, EventType::PipelineCompleted)
                .with("execution_id", run.execution_id.as_str())
                .with("result", result.clone()),
        );

        Ok(PipelineResult {
            execution_id: run.execution_id.clone(),
            status: RunStatus::Completed,
            result: Some(result),
            error: None,
            reason: None,
            failed_step: None,
        })
    }

    /// Persist and announce a failed run.
    async fn abort(
        &self,
        run: &Run<'_>,
        failed_step: Option<FailedStep>,
        err: &AppError,
    ) -> Result<PipelineResult> {
        let message = err.to_string();
        let reason = err.reason();
        self.executions
            .fail(&run.execution_id, failed_step.as_ref(), &message, reason)
            .await?;

        error!(
            reason,
            step_id = failed_step.as_ref().map_or("", |s| s.id.as_str()),
            error = %message,
            "pipeline failed"
        );
        self.log(
            run,
            failed_step.as_ref().map(|s| s.id.as_str()),
            LogLevel::Error,
            &message,
            json!({ "reason": reason, "failed_step": failed_step }),
        )
        .await;

        let mut event = BroadcastEvent::new(run.session_id, EventType::Error)
            .with("execution_id", run.execution_id.as_str())
            .with("message", message.as_str())
            .with("reason", reason);
        if let Some(step) = &failed_step {
            event = event
                .with("step_id", step.id.as_str())
                .with("step_name", step.name.as_str());
        }
        if let Some(item_id) = run.work_item_id {
            event = event.with("item_id", item_id);
        }
        self.hub.broadcast(event);

        Ok(PipelineResult {
            execution_id: run.execution_id.clone(),
            status: RunStatus::Failed,
            result: None,
            error: Some(message),
            reason: Some(reason.to_owned()),
            failed_step,
        })
    }

    async fn log(
        &self,
        run: &Run<'_>,
        step_id: Option<&str>,
        level: LogLevel,
        message: &str,
        fields: Value,
    ) {
        let entry = ExecutionLogEntry {
            execution_id: run.execution_id.clone(),
            step_id: step_id.map(str::to_owned),
            level,
            message: message.to_owned(),
            fields,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.executions.append_log(&entry).await {
            warn!(%err, "failed to append execution log entry");
        }
    }

    async fn enter_processing(&self, session_id: &str) -> Result<()> {
        let session = self.sessions.get_session(session_id).await?;
        if session.state == SessionState::Ready {
            self.sessions
                .transition(session_id, SessionState::Processing)
                .await?;
        }
        Ok(())
    }

    /// Return the session to `ready`, or to `error` when the worker itself broke.
    async fn leave_processing(&self, session_id: &str, broken: Option<(&str, &str)>) {
        let state = match self.sessions.get_session(session_id).await {
            Ok(session) => session.state,
            Err(err) => {
                warn!(%err, "failed to read session after run");
                return;
            }
        };
        if state != SessionState::Processing {
            return;
        }
        let result = match broken {
            Some((message, reason)) => self
                .sessions
                .record_error(session_id, message, reason)
                .await
                .map(drop),
            None => self
                .sessions
                .transition(session_id, SessionState::Ready)
                .await
                .map(drop),
        };
        if let Err(err) = result {
            warn!(%err, "failed to settle session state after run");
        }
    }
}

fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.saturating_mul(100) / total).unwrap_or(100)
}
