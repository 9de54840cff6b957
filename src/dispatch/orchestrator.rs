//! Batch dispatch: fan an automation execution out to its recipients.
//!
//! The recipient list is resolved once, then worked through a windowed
//! `JoinSet`: at most `max_concurrent` tasks in flight, every task pacing
//! itself on the shared token bucket. A recipient failing, transiently or
//! permanently, never affects its siblings. Fan-in reduces recipient rows
//! into `ExecutionStats` and closes the execution row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::cancel::CancelRegistry;
use super::rate_limit::TokenBucket;
use crate::engine::FlowEngine;
use crate::error::{Error, Result};
use crate::flow::FlowDefinition;
use crate::gateway::AudienceResolver;
use crate::metrics;
use crate::schedule::ScheduleWindow;
use crate::storage::{
    Automation, AutomationExecution, DispatchOverrides, DispatchSettings, ExecutionStatus,
    RecipientRecord, RecipientStatus, RetryPolicy, SqliteStorage,
};

/// Everything a recipient task needs, cloned per spawn.
struct RecipientTaskTemplate {
    engine: FlowEngine,
    definition: Arc<FlowDefinition>,
    flow_id: String,
    bucket: Arc<TokenBucket>,
    retry: RetryPolicy,
    window: Option<(ScheduleWindow, Tz)>,
}

/// Terminal result of one recipient task.
struct RecipientOutcome {
    status: RecipientStatus,
    retry_count: u32,
    message_id: Option<String>,
    error: Option<String>,
}

/// Drives automation executions end to end.
#[derive(Clone)]
pub struct Dispatcher {
    storage: SqliteStorage,
    engine: FlowEngine,
    resolver: Arc<dyn AudienceResolver>,
    cancels: CancelRegistry,
}

impl Dispatcher {
    pub fn new(
        storage: SqliteStorage,
        engine: FlowEngine,
        resolver: Arc<dyn AudienceResolver>,
    ) -> Self {
        Self {
            storage,
            engine,
            resolver,
            cancels: CancelRegistry::new(),
        }
    }

    /// Request cancellation of a running execution. Pending recipients
    /// are marked cancelled; in-flight tasks finish on their own.
    pub async fn request_cancel(&self, execution_id: &str) -> bool {
        self.cancels.request_cancel(execution_id).await
    }

    /// Create the execution row for one occurrence of an automation.
    pub async fn create_execution(
        &self,
        automation: &Automation,
        scheduled_for: Option<DateTime<Utc>>,
        overrides: Option<DispatchOverrides>,
    ) -> Result<AutomationExecution> {
        let execution = AutomationExecution {
            id: uuid::Uuid::new_v4().to_string(),
            automation_id: automation.id.clone(),
            flow_id: automation.flow_id.clone(),
            status: ExecutionStatus::Pending,
            scheduled_for,
            overrides,
            stats: Default::default(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        self.storage.save_execution(&execution).await?;
        Ok(execution)
    }

    /// Manual trigger: run an automation right now with its own settings
    /// and no window constraint.
    pub async fn trigger(&self, automation_id: &str) -> Result<AutomationExecution> {
        let automation = self
            .storage
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Automation not found: {}", automation_id)))?;

        let settings = automation.settings.clone();
        let execution = self.create_execution(&automation, None, None).await?;
        self.dispatch(&automation, execution, settings, None).await
    }

    /// Run one execution to its terminal status.
    ///
    /// `settings` is the effective configuration for this occurrence (a
    /// modify exception may have overridden the automation's defaults);
    /// `window` is re-checked before every send so a long-running batch
    /// never delivers outside it.
    #[instrument(skip_all, fields(execution_id = %execution.id, automation_id = %automation.id))]
    pub async fn dispatch(
        &self,
        automation: &Automation,
        mut execution: AutomationExecution,
        settings: DispatchSettings,
        window: Option<(ScheduleWindow, Tz)>,
    ) -> Result<AutomationExecution> {
        if !automation.enabled {
            return Err(Error::Execution(format!(
                "Automation '{}' is disabled",
                automation.name
            )));
        }

        // Guarded pending -> running flip. When several dispatchers race on
        // the same row (manual trigger vs. poller pickup), the loser walks
        // away without touching anything.
        if !self.storage.claim_execution(&execution.id).await? {
            debug!("execution already claimed elsewhere");
            return Ok(execution);
        }

        let cancel_flag = self.cancels.register(&execution.id).await;
        metrics::inc_active_dispatches();
        let started = std::time::Instant::now();

        let result = self
            .fan_out(automation, &mut execution, settings, window, &cancel_flag)
            .await;

        self.cancels.unregister(&execution.id).await;
        metrics::dec_active_dispatches();
        metrics::record_dispatch_duration(started.elapsed());

        match result {
            Ok(()) => {
                info!(
                    status = %execution.status,
                    total = execution.stats.total,
                    sent = execution.stats.sent,
                    failed = execution.stats.failed,
                    "dispatch finished"
                );
                Ok(execution)
            }
            Err(e) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(e.to_string());
                execution.finished_at = Some(Utc::now());
                if let Err(save_err) = self.storage.save_execution(&execution).await {
                    error!(error = %save_err, "failed to record execution failure");
                }
                error!(error = %e, "dispatch failed");
                Err(e)
            }
        }
    }

    async fn fan_out(
        &self,
        automation: &Automation,
        execution: &mut AutomationExecution,
        settings: DispatchSettings,
        window: Option<(ScheduleWindow, Tz)>,
        cancel_flag: &Arc<AtomicBool>,
    ) -> Result<()> {
        let (record, definition) = self.engine.load_flow(&automation.flow_id).await?;
        let recipients = self
            .resolver
            .resolve(&automation.audience, &automation.organization_id)
            .await?;

        execution.status = ExecutionStatus::Running;
        execution.started_at = Utc::now();
        execution.stats.total = recipients.len() as u64;
        self.storage.save_execution(execution).await?;

        let mut rows = Vec::with_capacity(recipients.len());
        for subject_id in &recipients {
            let row = RecipientRecord {
                id: uuid::Uuid::new_v4().to_string(),
                execution_id: execution.id.clone(),
                subject_id: subject_id.clone(),
                status: RecipientStatus::Pending,
                retry_count: 0,
                message_id: None,
                last_error: None,
                updated_at: Utc::now(),
            };
            self.storage.save_recipient(&row).await?;
            rows.push(row);
        }

        info!(
            recipients = recipients.len(),
            rate_limit_per_hour = settings.rate_limit_per_hour,
            max_concurrent = settings.max_concurrent,
            "dispatch starting"
        );

        let template = RecipientTaskTemplate {
            engine: self.engine.clone(),
            definition: Arc::new(definition),
            flow_id: record.id,
            bucket: Arc::new(TokenBucket::new(
                settings.rate_limit_per_hour,
                settings.max_concurrent,
            )),
            retry: settings.retry,
            window,
        };
        let max_concurrent = (settings.max_concurrent as usize).max(1);

        let mut join_set: JoinSet<(usize, RecipientOutcome)> = JoinSet::new();
        let mut next_index = 0usize;
        let mut cancelled = false;

        // Spawn the initial batch up to max_concurrent.
        while next_index < recipients.len() && join_set.len() < max_concurrent {
            spawn_recipient(&mut join_set, next_index, recipients[next_index].clone(), &template);
            next_index += 1;
        }

        // Join results and spawn more as slots free up. After a cancel no
        // new tasks start, but whatever is in flight joins normally.
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    let row = &mut rows[index];
                    row.status = outcome.status;
                    row.retry_count = outcome.retry_count;
                    row.message_id = outcome.message_id;
                    row.last_error = outcome.error;
                    row.updated_at = Utc::now();
                    self.storage.save_recipient(row).await?;
                    metrics::record_recipient_status(outcome.status.to_string().as_str());
                }
                Err(join_err) => {
                    // The recipient's row stays pending and is swept into
                    // a failure below.
                    error!(error = %join_err, "recipient task aborted");
                }
            }

            if !cancelled && cancel_flag.load(Ordering::SeqCst) {
                cancelled = true;
                info!(
                    dispatched = next_index,
                    remaining = recipients.len() - next_index,
                    "cancellation requested, draining in-flight tasks"
                );
            }

            while !cancelled && next_index < recipients.len() && join_set.len() < max_concurrent {
                spawn_recipient(&mut join_set, next_index, recipients[next_index].clone(), &template);
                next_index += 1;
            }
        }

        // Anything still pending was either never spawned (cancel) or its
        // task aborted.
        for row in rows.iter_mut().filter(|r| r.status == RecipientStatus::Pending) {
            row.status = if cancelled {
                RecipientStatus::Cancelled
            } else {
                row.last_error = Some("dispatch task aborted".to_string());
                RecipientStatus::Failed
            };
            row.updated_at = Utc::now();
            self.storage.save_recipient(row).await?;
        }

        execution.stats = self.storage.refresh_execution_stats(&execution.id).await?;
        execution.status = if cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Completed
        };
        execution.finished_at = Some(Utc::now());
        execution.error = None;
        self.storage.save_execution(execution).await?;

        Ok(())
    }

    /// Apply a delivery or read receipt to the recipient owning the
    /// message id, then refresh the owning execution's stats. Unknown or
    /// out-of-order receipts are dropped.
    pub async fn record_receipt(
        &self,
        message_id: &str,
        receipt_status: &str,
    ) -> Result<Option<RecipientRecord>> {
        let status: RecipientStatus = receipt_status
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid receipt status: {receipt_status}")))?;
        let updated = self
            .storage
            .record_delivery_receipt(message_id, status)
            .await?;
        if let Some(recipient) = &updated {
            self.storage
                .refresh_execution_stats(&recipient.execution_id)
                .await?;
        }
        Ok(updated)
    }
}

fn spawn_recipient(
    join_set: &mut JoinSet<(usize, RecipientOutcome)>,
    index: usize,
    subject_id: String,
    template: &RecipientTaskTemplate,
) {
    let engine = template.engine.clone();
    let definition = template.definition.clone();
    let flow_id = template.flow_id.clone();
    let bucket = template.bucket.clone();
    let retry = template.retry;
    let window = template.window;

    join_set.spawn(async move {
        let outcome =
            run_recipient(engine, definition, flow_id, bucket, retry, window, subject_id).await;
        (index, outcome)
    });
}

/// One recipient's full delivery attempt cycle.
async fn run_recipient(
    engine: FlowEngine,
    definition: Arc<FlowDefinition>,
    flow_id: String,
    bucket: Arc<TokenBucket>,
    retry: RetryPolicy,
    window: Option<(ScheduleWindow, Tz)>,
    subject_id: String,
) -> RecipientOutcome {
    let mut attempt: u32 = 1;

    loop {
        if let Some((window, tz)) = &window {
            wait_for_window(window, *tz).await;
        }
        bucket.acquire().await;

        let mut variables = HashMap::new();
        variables.insert("contact_id".to_string(), Value::String(subject_id.clone()));

        match engine
            .start_flow_parsed(&flow_id, &definition, &subject_id, variables)
            .await
        {
            Ok(turn) => {
                // Suspended runs sit at a question awaiting the reply; the
                // send itself succeeded.
                let status = if turn.suspended {
                    RecipientStatus::Sent
                } else {
                    RecipientStatus::Completed
                };
                return RecipientOutcome {
                    status,
                    retry_count: attempt.saturating_sub(1),
                    message_id: turn.receipts.into_iter().next().map(|r| r.message_id),
                    error: None,
                };
            }
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = retry_delay(&retry, attempt);
                warn!(
                    subject_id = %subject_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "transient delivery failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
            Err(e) => {
                return RecipientOutcome {
                    status: RecipientStatus::Failed,
                    retry_count: attempt.saturating_sub(1),
                    message_id: None,
                    error: Some(e.to_string()),
                };
            }
        }
    }
}

/// Exponential backoff: base * 2^(attempt-1), capped at max_delay.
fn retry_delay(retry: &RetryPolicy, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let secs = retry
        .base_delay_secs
        .saturating_mul(1u64 << shift)
        .min(retry.max_delay_secs);
    Duration::from_secs(secs)
}

/// Sleep until the window contains the current wall-clock time in `tz`.
async fn wait_for_window(window: &ScheduleWindow, tz: Tz) {
    loop {
        let wait = window_wait(window, tz, Utc::now());
        if wait.is_zero() {
            return;
        }
        debug!(
            wait_secs = wait.as_secs(),
            "outside send window, waiting for it to reopen"
        );
        tokio::time::sleep(wait).await;
    }
}

/// How long until `now` falls inside the window on `tz`'s wall clock.
/// Zero when it already does.
fn window_wait(window: &ScheduleWindow, tz: Tz, now: DateTime<Utc>) -> Duration {
    let local = now.with_timezone(&tz);
    if window.contains(local.time()) {
        return Duration::ZERO;
    }

    let date = if local.time() < window.start_time {
        local.date_naive()
    } else {
        local.date_naive() + chrono::Duration::days(1)
    };
    let target_naive = date.and_time(window.start_time);
    let target = match tz.from_local_datetime(&target_naive) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        // A DST gap at the window start: read the naive time as UTC-offset
        // shifted, which lands just past the gap.
        chrono::LocalResult::None => tz.from_utc_datetime(&target_naive),
    };

    (target.with_timezone(&Utc) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{MockGateway, StaticAudience};
    use crate::gateway::{AudienceSpec, GatewayError};
    use crate::storage::FlowRecord;
    use chrono::NaiveTime;

    const BROADCAST_YAML: &str = r#"
name: broadcast
organization_id: org-1
start_node_id: n0
nodes:
  - id: n0
    type: start
    next_node_ids: [n1]
  - id: n1
    type: message
    config:
      text: "Campaign message"
    next_node_ids: [n2]
  - id: n2
    type: end
"#;

    const SURVEY_YAML: &str = r#"
name: survey
organization_id: org-1
start_node_id: n0
nodes:
  - id: n0
    type: start
    next_node_ids: [n1]
  - id: n1
    type: question
    config:
      prompt: "Rate us 1-5"
      variable: rating
      validation: numeric
    next_node_ids: [n2]
  - id: n2
    type: end
"#;

    struct Fixture {
        dispatcher: Dispatcher,
        storage: SqliteStorage,
        gateway: Arc<MockGateway>,
        automation: Automation,
    }

    async fn fixture(flow_yaml: &str, subjects: Vec<String>, settings: DispatchSettings) -> Fixture {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let gateway = MockGateway::new();
        let record = storage
            .save_flow(&FlowRecord {
                id: "fl-1".to_string(),
                name: "flow".to_string(),
                organization_id: "org-1".to_string(),
                definition: flow_yaml.to_string(),
                version: 1,
                enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let automation = Automation {
            id: "auto-1".to_string(),
            organization_id: "org-1".to_string(),
            name: "campaign".to_string(),
            flow_id: record.id,
            audience: AudienceSpec::ContactList { contact_ids: vec![] },
            settings,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        storage.save_automation(&automation).await.unwrap();

        let engine = FlowEngine::new(storage.clone(), gateway.clone());
        let dispatcher = Dispatcher::new(
            storage.clone(),
            engine,
            Arc::new(StaticAudience(subjects)),
        );

        Fixture { dispatcher, storage, gateway, automation }
    }

    fn subjects(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("contact-{i}")).collect()
    }

    fn fast_settings(rate_per_hour: u32, max_concurrent: u32) -> DispatchSettings {
        DispatchSettings {
            rate_limit_per_hour: rate_per_hour,
            max_concurrent,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 1,
                max_delay_secs: 8,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_paces_large_batch() {
        // 1000 recipients at 600/hour is one send per six seconds: the
        // batch takes at least 100 minutes of (virtual) wall clock.
        let fx = fixture(BROADCAST_YAML, subjects(1000), fast_settings(600, 10)).await;
        let start = tokio::time::Instant::now();

        let execution = fx.dispatcher.trigger("auto-1").await.unwrap();

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(6000),
            "finished too fast: {:?}",
            elapsed
        );
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stats.total, 1000);
        assert_eq!(execution.stats.sent, 1000);
        assert_eq!(execution.stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_then_succeed() {
        let fx = fixture(BROADCAST_YAML, subjects(1), fast_settings(600_000, 4)).await;
        fx.gateway
            .fail_next("contact-0", GatewayError::Transient("timeout".to_string()));
        fx.gateway
            .fail_next("contact-0", GatewayError::Transient("timeout".to_string()));

        let execution = fx.dispatcher.trigger("auto-1").await.unwrap();

        assert_eq!(execution.stats.sent, 1);
        assert_eq!(execution.stats.failed, 0);
        let recipients = fx.storage.list_recipients(&execution.id).await.unwrap();
        assert_eq!(recipients[0].status, RecipientStatus::Completed);
        assert_eq!(recipients[0].retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_recipient_only() {
        let fx = fixture(BROADCAST_YAML, subjects(3), fast_settings(600_000, 1)).await;
        for _ in 0..3 {
            fx.gateway
                .fail_next("contact-1", GatewayError::Transient("timeout".to_string()));
        }

        let execution = fx.dispatcher.trigger("auto-1").await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stats.total, 3);
        assert_eq!(execution.stats.sent, 2);
        assert_eq!(execution.stats.failed, 1);
        let recipients = fx.storage.list_recipients(&execution.id).await.unwrap();
        let failed: Vec<_> = recipients
            .iter()
            .filter(|r| r.status == RecipientStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].subject_id, "contact-1");
        assert_eq!(failed[0].retry_count, 2);
        assert!(failed[0].last_error.as_deref().unwrap_or("").contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_skips_retries() {
        let fx = fixture(BROADCAST_YAML, subjects(1), fast_settings(600_000, 1)).await;
        fx.gateway
            .fail_next("contact-0", GatewayError::Permanent("opted out".to_string()));

        let execution = fx.dispatcher.trigger("auto-1").await.unwrap();

        let recipients = fx.storage.list_recipients(&execution.id).await.unwrap();
        assert_eq!(recipients[0].status, RecipientStatus::Failed);
        assert_eq!(recipients[0].retry_count, 0);
        assert_eq!(execution.stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspending_flow_marks_recipients_sent() {
        let fx = fixture(SURVEY_YAML, subjects(2), fast_settings(600_000, 2)).await;

        let execution = fx.dispatcher.trigger("auto-1").await.unwrap();

        assert_eq!(execution.stats.sent, 2);
        assert_eq!(execution.stats.completed, 0);
        let recipients = fx.storage.list_recipients(&execution.id).await.unwrap();
        assert!(recipients.iter().all(|r| r.status == RecipientStatus::Sent));
        assert!(recipients.iter().all(|r| r.message_id.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_lets_in_flight_finish() {
        // One send per second, one at a time: cancel lands mid-batch.
        let fx = fixture(BROADCAST_YAML, subjects(5), fast_settings(3600, 1)).await;
        let automation = fx.automation.clone();
        let execution = fx
            .dispatcher
            .create_execution(&automation, None, None)
            .await
            .unwrap();
        let execution_id = execution.id.clone();

        let dispatcher = fx.dispatcher.clone();
        let handle = tokio::spawn(async move {
            dispatcher
                .dispatch(&automation, execution, fast_settings(3600, 1), None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(fx.dispatcher.request_cancel(&execution_id).await);

        let execution = handle.await.unwrap().unwrap();

        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        let recipients = fx.storage.list_recipients(&execution.id).await.unwrap();
        let cancelled = recipients
            .iter()
            .filter(|r| r.status == RecipientStatus::Cancelled)
            .count();
        let delivered = recipients
            .iter()
            .filter(|r| r.status == RecipientStatus::Completed)
            .count();
        assert!(cancelled >= 1, "nothing was cancelled");
        assert!(delivered >= 2, "in-flight work did not finish");
        assert_eq!(cancelled + delivered, 5);
        assert_eq!(execution.stats.total, 5);
    }

    #[tokio::test]
    async fn test_disabled_automation_refuses_dispatch() {
        let fx = fixture(BROADCAST_YAML, subjects(1), fast_settings(600, 1)).await;
        fx.storage.set_automation_enabled("auto-1", false).await.unwrap();

        let err = fx.dispatcher.trigger("auto-1").await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");
    }

    #[tokio::test]
    async fn test_receipt_updates_recipient_and_stats() {
        let fx = fixture(SURVEY_YAML, subjects(1), fast_settings(600_000, 1)).await;
        let execution = fx.dispatcher.trigger("auto-1").await.unwrap();
        let recipients = fx.storage.list_recipients(&execution.id).await.unwrap();
        let message_id = recipients[0].message_id.clone().unwrap();

        let updated = fx
            .dispatcher
            .record_receipt(&message_id, "delivered")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.status, RecipientStatus::Delivered);
        let refreshed = fx.storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(refreshed.stats.delivered, 1);
        assert_eq!(refreshed.stats.sent, 1);
    }

    #[tokio::test]
    async fn test_receipt_with_unknown_status_is_rejected() {
        let fx = fixture(SURVEY_YAML, subjects(1), fast_settings(600_000, 1)).await;
        let execution = fx.dispatcher.trigger("auto-1").await.unwrap();
        let recipients = fx.storage.list_recipients(&execution.id).await.unwrap();
        let message_id = recipients[0].message_id.clone().unwrap();

        let err = fx
            .dispatcher
            .record_receipt(&message_id, "bounced")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_delay_secs: 60,
            max_delay_secs: 3600,
        };
        assert_eq!(retry_delay(&retry, 1), Duration::from_secs(60));
        assert_eq!(retry_delay(&retry, 2), Duration::from_secs(120));
        assert_eq!(retry_delay(&retry, 3), Duration::from_secs(240));
        assert_eq!(retry_delay(&retry, 8), Duration::from_secs(3600));
        // Shift saturates instead of overflowing for absurd attempts.
        assert_eq!(retry_delay(&retry, 64), Duration::from_secs(3600));
    }

    #[test]
    fn test_window_wait_math() {
        let tz: Tz = "America/Sao_Paulo".parse().unwrap();
        let window = ScheduleWindow {
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        };

        // 10:00 local: inside, no wait.
        let inside = tz.with_ymd_and_hms(2025, 11, 20, 10, 0, 0).unwrap().with_timezone(&Utc);
        assert_eq!(window_wait(&window, tz, inside), Duration::ZERO);

        // 07:30 local: wait until 09:00 the same day.
        let early = tz.with_ymd_and_hms(2025, 11, 20, 7, 30, 0).unwrap().with_timezone(&Utc);
        assert_eq!(window_wait(&window, tz, early), Duration::from_secs(90 * 60));

        // 19:00 local: wait until 09:00 tomorrow.
        let late = tz.with_ymd_and_hms(2025, 11, 20, 19, 0, 0).unwrap().with_timezone(&Utc);
        assert_eq!(window_wait(&window, tz, late), Duration::from_secs(14 * 3600));
    }
}
