//! Job queue monitor: bounded dispatch and stale-work reclamation.
//!
//! One cancellable task ticks two intervals. The fast one claims pending
//! items while their session has free slots and hands each claimed item to
//! a [`JobDispatcher`]. The slow one fails items that have been running
//! longer than the stale timeout, which frees their slots. Reclamation only
//! fixes bookkeeping; it never touches the worker process.
//!
//! Every failed item stores a message, a reason code, and the failing step
//! when there was one, and observers get an `error` event with the same
//! detail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broadcast::BroadcastHub;
use crate::config::GlobalConfig;
use crate::jobs;
use crate::models::event::{BroadcastEvent, EventType};
use crate::models::work_item::{
    JobPayload, WorkFailure, WorkItem, WorkStatus, REASON_RECLAIMED, REASON_STALE_WORK,
};
use crate::orchestrator::pipeline::PipelineOrchestrator;
use crate::persistence::db::Database;
use crate::persistence::work_item_repo::{SlotUsage, WorkItemRepo};
use crate::process::BoxFuture;
use crate::{AppError, Result};

/// Runs one claimed work item to completion.
pub trait JobDispatcher: Send + Sync {
    /// Execute `item`, which is already `running`, and settle its status.
    fn dispatch(&self, item: WorkItem) -> BoxFuture<'_, ()>;
}

/// Dispatcher that runs each item's step list through the orchestrator.
pub struct PipelineDispatcher {
    orchestrator: Arc<PipelineOrchestrator>,
    work_items: WorkItemRepo,
    hub: Arc<BroadcastHub>,
}

impl PipelineDispatcher {
    /// Dispatcher over `orchestrator`.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        orchestrator: Arc<PipelineOrchestrator>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            orchestrator,
            work_items: WorkItemRepo::new(db),
            hub,
        }
    }
}

impl JobDispatcher for PipelineDispatcher {
    fn dispatch(&self, item: WorkItem) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let steps = jobs::steps_for(&item.payload);
            let outcome = self
                .orchestrator
                .run(&item.session_id, Some(&item.id), steps)
                .await;

            // A failed run already announced its error; only bookkeeping
            // failures still need an event here.
            let settled = match outcome {
                Ok(result) if result.is_success() => self.work_items.complete(&item.id).await,
                Ok(result) => {
                    let failure = WorkFailure::new(
                        result.error.unwrap_or_else(|| "pipeline failed".into()),
                        result.reason.unwrap_or_else(|| "step_failure".into()),
                    )
                    .at_step(result.failed_step.map(|step| step.id));
                    self.work_items.fail(&item.id, &failure).await
                }
                Err(err) => {
                    let failure = WorkFailure::new(err.to_string(), err.reason());
                    let settled = self.work_items.fail(&item.id, &failure).await;
                    if matches!(settled, Ok(true)) {
                        self.hub.broadcast(failure_event(&item, &failure));
                    }
                    settled
                }
            };

            match settled {
                Ok(true) => info!(item_id = %item.id, "work item settled"),
                Ok(false) => warn!(item_id = %item.id, "work item was reclaimed before it finished"),
                Err(err) => error!(item_id = %item.id, %err, "failed to settle work item"),
            }
        })
    }
}

/// `error` event carrying exactly what was persisted for a failed item.
fn failure_event(item: &WorkItem, failure: &WorkFailure) -> BroadcastEvent {
    let mut event = BroadcastEvent::new(&item.session_id, EventType::Error)
        .with("item_id", item.id.as_str())
        .with("job_type", item.job_type())
        .with("message", failure.message.as_str())
        .with("reason", failure.reason.as_str());
    if let Some(step_id) = &failure.failed_step_id {
        event = event.with("step_id", step_id.as_str());
    }
    event
}

/// Polling monitor over the persisted queue.
pub struct QueueMonitor {
    work_items: WorkItemRepo,
    dispatcher: Arc<dyn JobDispatcher>,
    hub: Arc<BroadcastHub>,
    concurrency_limit: u32,
    poll_interval: Duration,
    stale_scan_interval: Duration,
    stale_timeout: chrono::Duration,
}

impl QueueMonitor {
    /// Monitor configured from `[queue]`.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        config: &GlobalConfig,
        dispatcher: Arc<dyn JobDispatcher>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            work_items: WorkItemRepo::new(db),
            dispatcher,
            hub,
            concurrency_limit: config.queue.concurrency_limit,
            poll_interval: Duration::from_secs(config.queue.poll_interval_seconds),
            stale_scan_interval: Duration::from_secs(config.queue.stale_scan_interval_seconds),
            stale_timeout: config.stale_timeout(),
        }
    }

    /// Per-session concurrency limit.
    #[must_use]
    pub fn concurrency_limit(&self) -> u32 {
        self.concurrency_limit
    }

    /// Validate and queue a job.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for a payload that can never run, or
    /// `AppError::Db` if the insert fails.
    pub async fn enqueue(&self, session_id: &str, payload: JobPayload) -> Result<WorkItem> {
        jobs::validate(&payload)?;
        let item = self
            .work_items
            .enqueue(&WorkItem::new(session_id, payload))
            .await?;
        info!(session_id, item_id = %item.id, job_type = item.job_type(), "work item queued");
        Ok(item)
    }

    /// Free slots of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the count fails.
    pub async fn available_slots(&self, session_id: &str) -> Result<u32> {
        self.work_items
            .available_slots(session_id, self.concurrency_limit)
            .await
    }

    /// Running and pending counts per session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn slot_usage(&self) -> Result<Vec<SlotUsage>> {
        self.work_items.slot_usage().await
    }

    /// Claim and dispatch as many pending items as free slots allow.
    ///
    /// Returns how many items were claimed. Each claim is a single
    /// conditional update, so concurrent cycles cannot overfill a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the queue cannot be read.
    pub async fn run_dispatch_cycle(&self) -> Result<usize> {
        let pending = self.work_items.find_pending(None).await?;
        let mut claimed = 0;
        let mut full: Vec<String> = Vec::new();

        for item in pending {
            if full.contains(&item.session_id) {
                continue;
            }
            if !self.work_items.try_claim(&item.id, self.concurrency_limit).await? {
                debug!(session_id = %item.session_id, "no free slot");
                full.push(item.session_id.clone());
                continue;
            }

            claimed += 1;
            let item = WorkItem {
                status: WorkStatus::Running,
                started_at: Some(Utc::now()),
                ..item
            };
            info!(session_id = %item.session_id, item_id = %item.id, "work item dispatched");

            let dispatcher = Arc::clone(&self.dispatcher);
            let span = info_span!("job", item_id = %item.id, session_id = %item.session_id);
            tokio::spawn(async move { dispatcher.dispatch(item).await }.instrument(span));
        }
        Ok(claimed)
    }

    /// Fail every item running longer than the stale timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the scan fails.
    pub async fn run_stale_scan(&self) -> Result<Vec<WorkItem>> {
        let stale = self
            .work_items
            .find_stale(None, self.stale_timeout, Utc::now())
            .await?;

        let mut reclaimed = Vec::new();
        for item in stale {
            let failure = WorkFailure::new(
                format!(
                    "stale: running longer than {}s",
                    self.stale_timeout.num_seconds()
                ),
                REASON_STALE_WORK,
            );
            if self.reclaim_item(&item, &failure).await? {
                reclaimed.push(item);
            }
        }
        Ok(reclaimed)
    }

    /// Operator-initiated reclamation of one running item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown item and
    /// `AppError::InvalidTransition` if it is not running.
    pub async fn force_reclaim(&self, item_id: &str) -> Result<WorkItem> {
        let item = self
            .work_items
            .get_by_id(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("work item {item_id} not found")))?;
        if item.status != WorkStatus::Running
            || !self
                .reclaim_item(
                    &item,
                    &WorkFailure::new("reclaimed by operator", REASON_RECLAIMED),
                )
                .await?
        {
            return Err(AppError::InvalidTransition(format!(
                "work item {item_id} is not running"
            )));
        }
        self.work_items
            .get_by_id(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("work item {item_id} not found")))
    }

    async fn reclaim_item(&self, item: &WorkItem, failure: &WorkFailure) -> Result<bool> {
        if !self.work_items.fail(&item.id, failure).await? {
            return Ok(false);
        }
        warn!(
            session_id = %item.session_id,
            item_id = %item.id,
            started_at = ?item.started_at,
            reason = %failure.reason,
            error = %failure.message,
            "work item reclaimed"
        );
        self.hub.broadcast(
            BroadcastEvent::new(&item.session_id, EventType::ItemReclaimed)
                .with("item_id", item.id.as_str())
                .with("job_type", item.job_type())
                .with("reason", failure.reason.as_str()),
        );
        self.hub.broadcast(failure_event(item, failure));
        Ok(true)
    }

    /// Spawn the polling loop. Runs until `cancel` fires.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let mut dispatch = tokio::time::interval(self.poll_interval);
                dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut stale = tokio::time::interval(self.stale_scan_interval);
                stale.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!("queue monitor started");

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("queue monitor shutting down");
                            break;
                        }
                        _ = dispatch.tick() => {
                            if let Err(err) = self.run_dispatch_cycle().await {
                                error!(%err, "dispatch cycle failed");
                            }
                        }
                        _ = stale.tick() => {
                            match self.run_stale_scan().await {
                                Ok(reclaimed) if !reclaimed.is_empty() => {
                                    info!(count = reclaimed.len(), "stale items reclaimed");
                                }
                                Ok(_) => {}
                                Err(err) => error!(%err, "stale scan failed"),
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("queue_monitor")),
        )
    }
}

/// Start/stop switch for the monitor loop.
pub struct MonitorController {
    monitor: Arc<QueueMonitor>,
    shutdown: CancellationToken,
    running: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    // Mirrors `running` for the synchronous status query.
    active: AtomicBool,
}

impl MonitorController {
    /// Controller whose loops also stop when `shutdown` fires.
    #[must_use]
    pub fn new(monitor: Arc<QueueMonitor>, shutdown: CancellationToken) -> Self {
        Self {
            monitor,
            shutdown,
            running: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// The monitored queue.
    #[must_use]
    pub fn monitor(&self) -> &Arc<QueueMonitor> {
        &self.monitor
    }

    /// Start the loop. Returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return false;
        }
        let token = self.shutdown.child_token();
        let handle = Arc::clone(&self.monitor).spawn(token.clone());
        *running = Some((token, handle));
        self.active.store(true, Ordering::SeqCst);
        true
    }

    /// Stop the loop and wait for it to exit. Returns `false` if it was not running.
    ///
    /// Items already dispatched keep running.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        self.active.store(false, Ordering::SeqCst);
        let Some((token, handle)) = running.take() else {
            return false;
        };
        token.cancel();
        if let Err(err) = handle.await {
            warn!(%err, "queue monitor task ended abnormally");
        }
        true
    }

    /// Whether the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }
}
