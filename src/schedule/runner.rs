//! Background schedule polling.
//!
//! A single task polls SQLite on a timer. Each tick advances due schedules
//! (resolving exceptions into skip, fire, or reschedule) and dispatches
//! pending executions whose fire time has arrived. Firing and dispatching
//! are decoupled through the executions table: a rescheduled occurrence
//! waits in the queue for its new instant without blocking the recurrence
//! cursor, and a rate-limited batch never stalls the poll loop.
//!
//! Multiple runner instances can share one database. A short firing lease
//! on the schedule row and a guarded pending-to-running flip on the
//! execution row keep each occurrence single-shot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::engine::FlowEngine;
use crate::error::{Error, Result};
use crate::gateway::{HolidayCalendar, NoHolidays};
use crate::metrics;
use crate::storage::{ExecutionStatus, SqliteStorage};

use super::exceptions::{resolve_occurrence, Occurrence};
use super::recurrence::compute_next;
use super::types::{Schedule, ScheduleWindow};

/// Poll interval for checking due schedules and executions (in milliseconds).
const POLL_INTERVAL_MS: u64 = 1000;

/// Most rows pulled per poll in each phase.
const POLL_BATCH_LIMIT: usize = 32;

/// Firing lease duration in seconds. Long enough to cover one occurrence
/// hand-off, short enough that a crashed runner frees its schedules soon.
const LEASE_SECONDS: i64 = 300;

/// Polls for due schedules and fires them.
///
/// Owns a background task started with [`start`](Self::start) and stopped
/// with [`stop`](Self::stop); the per-tick work lives in free functions so
/// tests can drive it with explicit clocks.
pub struct ScheduleRunner {
    storage: SqliteStorage,
    engine: FlowEngine,
    dispatcher: Dispatcher,
    holidays: Arc<dyn HolidayCalendar>,
    runner_id: String,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    poll_interval_ms: u64,
}

impl ScheduleRunner {
    pub fn new(storage: SqliteStorage, engine: FlowEngine, dispatcher: Dispatcher) -> Self {
        Self {
            storage,
            engine,
            dispatcher,
            holidays: Arc::new(NoHolidays),
            runner_id: uuid::Uuid::new_v4().to_string(),
            shutdown_tx: None,
            handle: None,
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }

    /// Set custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Attach a holiday calendar for schedules that set `skip_holidays`.
    pub fn with_holidays(mut self, holidays: Arc<dyn HolidayCalendar>) -> Self {
        self.holidays = holidays;
        self
    }

    /// Identifier stamped on firing leases taken by this runner.
    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Start the background polling task.
    pub async fn start(&mut self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let storage = self.storage.clone();
        let engine = self.engine.clone();
        let dispatcher = self.dispatcher.clone();
        let holidays = self.holidays.clone();
        let runner_id = self.runner_id.clone();
        let poll_interval = self.poll_interval_ms;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(poll_interval));

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("schedule runner received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = poll_tick(
                            &storage,
                            &engine,
                            &dispatcher,
                            &holidays,
                            &runner_id,
                        ).await {
                            error!(error = %e, "schedule poll failed");
                        }
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!(
            poll_interval_ms = self.poll_interval_ms,
            runner_id = %self.runner_id,
            "schedule runner started"
        );
        Ok(())
    }

    /// Stop the background polling task.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| Error::Execution(format!("schedule runner task failed: {}", e)))?;
        }

        info!("schedule runner stopped");
        Ok(())
    }

    /// Check if the runner is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

/// One tick: advance due schedules, dispatch due executions, and drop
/// expired conversation state.
async fn poll_tick(
    storage: &SqliteStorage,
    engine: &FlowEngine,
    dispatcher: &Dispatcher,
    holidays: &Arc<dyn HolidayCalendar>,
    runner_id: &str,
) -> Result<()> {
    let now = Utc::now();
    advance_due_schedules(storage, dispatcher, holidays.as_ref(), runner_id, now).await?;
    dispatch_due_executions(storage, dispatcher, now).await?;
    engine.purge_expired().await?;
    Ok(())
}

/// Claim and handle every due schedule. Returns how many occurrences were
/// enqueued as executions.
async fn advance_due_schedules(
    storage: &SqliteStorage,
    dispatcher: &Dispatcher,
    holidays: &dyn HolidayCalendar,
    runner_id: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let due = storage.due_schedules(now, POLL_BATCH_LIMIT).await?;
    if due.is_empty() {
        return Ok(0);
    }

    let mut fired = 0;
    for schedule in due {
        let lease_until = now + ChronoDuration::seconds(LEASE_SECONDS);
        if !storage
            .claim_schedule(&schedule.id, runner_id, lease_until, now)
            .await?
        {
            continue;
        }

        match fire_schedule(storage, dispatcher, &schedule, holidays, now).await {
            Ok(true) => {
                fired += 1;
                metrics::record_schedule_fired();
            }
            Ok(false) => {}
            Err(e) => {
                error!(schedule_id = %schedule.id, error = %e, "schedule firing failed");
                metrics::record_schedule_error();
                if matches!(e, Error::Schedule(_) | Error::Validation(_)) {
                    // A broken recurrence or timezone fails identically on
                    // every poll. Park the schedule; re-saving it with a
                    // fresh next occurrence revives it.
                    if let Err(park) = storage.set_schedule_next(&schedule.id, None).await {
                        error!(schedule_id = %schedule.id, error = %park, "failed to park schedule");
                    }
                }
            }
        }

        storage.release_schedule(&schedule.id, runner_id).await?;
    }

    Ok(fired)
}

/// Handle one claimed schedule: resolve its due occurrence against the
/// exception list, enqueue an execution when it fires, and move the cursor
/// strictly past the occurrence. Returns whether an execution was enqueued.
async fn fire_schedule(
    storage: &SqliteStorage,
    dispatcher: &Dispatcher,
    schedule: &Schedule,
    holidays: &dyn HolidayCalendar,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(candidate) = schedule.next_scheduled_at else {
        // The due query filters on the cursor; reaching this means someone
        // nulled it between the query and the claim.
        return Ok(false);
    };

    let tz = schedule.tz()?;
    let automation = storage
        .get_automation(&schedule.automation_id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("Automation not found: {}", schedule.automation_id))
        })?;

    // Anchor the next occurrence at the poll instant, not the candidate:
    // after downtime the missed occurrences collapse into this one late
    // firing instead of replaying one per tick.
    let next = compute_next(schedule, candidate.max(now), holidays)?;

    if !automation.enabled {
        debug!(schedule_id = %schedule.id, "automation disabled, occurrence lapses");
        storage.set_schedule_next(&schedule.id, next).await?;
        return Ok(false);
    }

    let exceptions = storage.list_exceptions(&schedule.id).await?;
    match resolve_occurrence(&exceptions, candidate, &tz) {
        Occurrence::Skip => {
            info!(schedule_id = %schedule.id, %candidate, "occurrence suppressed by exception");
            storage.set_schedule_next(&schedule.id, next).await?;
            Ok(false)
        }
        Occurrence::Fire { fire_at, overrides } => {
            let execution = dispatcher
                .create_execution(&automation, Some(fire_at), overrides)
                .await?;
            info!(
                schedule_id = %schedule.id,
                execution_id = %execution.id,
                %fire_at,
                "occurrence enqueued"
            );
            storage.mark_schedule_fired(&schedule.id, now, next).await?;
            Ok(true)
        }
    }
}

/// Dispatch every pending execution whose fire time has arrived. Batches
/// run detached so an hours-long rate-limited send never blocks the poll
/// loop; the guarded claim inside [`Dispatcher::dispatch`] makes a repeat
/// pickup of a slow-starting row harmless.
async fn dispatch_due_executions(
    storage: &SqliteStorage,
    dispatcher: &Dispatcher,
    now: DateTime<Utc>,
) -> Result<usize> {
    let due = storage.due_executions(now, POLL_BATCH_LIMIT).await?;

    let mut started = 0;
    for execution in due {
        let Some(automation) = storage.get_automation(&execution.automation_id).await? else {
            warn!(execution_id = %execution.id, "owning automation is gone, failing execution");
            let mut failed = execution;
            failed.status = ExecutionStatus::Failed;
            failed.error = Some("automation no longer exists".to_string());
            failed.finished_at = Some(now);
            storage.save_execution(&failed).await?;
            continue;
        };

        if !automation.enabled {
            info!(execution_id = %execution.id, "automation disabled, cancelling queued execution");
            let mut cancelled = execution;
            cancelled.status = ExecutionStatus::Cancelled;
            cancelled.error = Some("automation disabled before dispatch".to_string());
            cancelled.finished_at = Some(now);
            storage.save_execution(&cancelled).await?;
            continue;
        }

        let settings = match &execution.overrides {
            Some(overrides) => overrides.apply(&automation.settings),
            None => automation.settings.clone(),
        };
        let window = match execution.scheduled_for {
            Some(_) => schedule_window_for(storage, &automation.id).await?,
            None => None,
        };

        let dispatcher = dispatcher.clone();
        let execution_id = execution.id.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher
                .dispatch(&automation, execution, settings, window)
                .await
            {
                error!(execution_id = %execution_id, error = %e, "queued dispatch failed");
            }
        });
        started += 1;
    }

    Ok(started)
}

/// Send window of the automation's schedule, when it has one with a
/// parseable timezone. Scheduled batches stay inside it; manual triggers
/// never come through here.
async fn schedule_window_for(
    storage: &SqliteStorage,
    automation_id: &str,
) -> Result<Option<(ScheduleWindow, Tz)>> {
    for schedule in storage.list_schedules(Some(automation_id)).await? {
        if let Ok(tz) = schedule.tz() {
            return Ok(Some((schedule.window, tz)));
        }
    }
    Ok(None)
}
