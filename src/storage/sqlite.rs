//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};
use crate::schedule::{ExceptionKind, Recurrence, Schedule, ScheduleException, ScheduleWindow};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    s.parse::<NaiveDate>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_time(s: &str) -> rusqlite::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Decode a JSON column into a typed value inside a row closure.
fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&mut conn)?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        Ok(storage)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&mut conn)?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        Ok(storage)
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // Configure SQLite for better concurrent access and reliability
        // Note: WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            -- Enable WAL mode for better concurrent reads during writes
            PRAGMA journal_mode = WAL;
            -- Wait up to 5 seconds when database is locked instead of failing immediately
            PRAGMA busy_timeout = 5000;
            -- Balance between safety and performance (fsync at critical moments)
            PRAGMA synchronous = NORMAL;
            -- Enable foreign key enforcement
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                definition TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                enabled INTEGER DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(organization_id, name)
            );

            CREATE TABLE IF NOT EXISTS flow_states (
                flow_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                current_node_id TEXT NOT NULL,
                variables TEXT NOT NULL,
                status TEXT NOT NULL,
                step_count INTEGER NOT NULL DEFAULT 0,
                execution_path TEXT NOT NULL,
                last_event_id TEXT,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT,
                PRIMARY KEY (flow_id, subject_id),
                FOREIGN KEY (flow_id) REFERENCES flows(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_flow_states_expiry
                ON flow_states(status, expires_at);

            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                audience TEXT NOT NULL,
                settings TEXT NOT NULL,
                enabled INTEGER DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (flow_id) REFERENCES flows(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_automations_org ON automations(organization_id);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL,
                recurrence TEXT NOT NULL,
                start_date TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                timezone TEXT NOT NULL,
                blackout_dates TEXT NOT NULL,
                skip_weekends INTEGER DEFAULT 0,
                skip_holidays INTEGER DEFAULT 0,
                is_paused INTEGER DEFAULT 0,
                next_scheduled_at TEXT,
                last_executed_at TEXT,
                execution_count INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_until TEXT,
                FOREIGN KEY (automation_id) REFERENCES automations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_due
                ON schedules(is_paused, next_scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_schedules_automation ON schedules(automation_id);

            CREATE TABLE IF NOT EXISTS schedule_exceptions (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                reschedule_to TEXT,
                modified_config TEXT,
                FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_schedule_exceptions_schedule
                ON schedule_exceptions(schedule_id, start_date);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                scheduled_for TEXT,
                overrides TEXT,
                stats TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT,
                FOREIGN KEY (automation_id) REFERENCES automations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_executions_automation
                ON executions(automation_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_executions_status
                ON executions(status, scheduled_for);

            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                message_id TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_execution ON recipients(execution_id);
            CREATE INDEX IF NOT EXISTS idx_recipients_message ON recipients(message_id);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Flow operations
    // ========================================================================

    /// Save a flow, upserting by (organization, name). A replace keeps the
    /// stored id and bumps the version. Returns the effective record.
    pub async fn save_flow(&self, flow: &FlowRecord) -> Result<FlowRecord> {
        let conn = self.conn.lock().await;
        let existing: Option<(String, String, u32)> = conn
            .query_row(
                "SELECT id, created_at, version FROM flows
                 WHERE organization_id = ?1 AND name = ?2",
                params![flow.organization_id, flow.name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let effective = if let Some((existing_id, existing_created_at, existing_version)) = existing
        {
            let version = existing_version + 1;
            conn.execute(
                "UPDATE flows
                 SET definition = ?1, version = ?2, enabled = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    flow.definition,
                    version,
                    flow.enabled,
                    flow.updated_at.to_rfc3339(),
                    existing_id
                ],
            )?;

            FlowRecord {
                id: existing_id,
                name: flow.name.clone(),
                organization_id: flow.organization_id.clone(),
                definition: flow.definition.clone(),
                version,
                enabled: flow.enabled,
                created_at: parse_datetime_utc(&existing_created_at)
                    .unwrap_or_else(|_| Utc::now()),
                updated_at: flow.updated_at,
            }
        } else {
            conn.execute(
                "INSERT INTO flows
                 (id, name, organization_id, definition, version, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    flow.id,
                    flow.name,
                    flow.organization_id,
                    flow.definition,
                    flow.version,
                    flow.enabled,
                    flow.created_at.to_rfc3339(),
                    flow.updated_at.to_rfc3339(),
                ],
            )?;

            flow.clone()
        };

        Ok(effective)
    }

    pub async fn get_flow(&self, id: &str) -> Result<Option<FlowRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, name, organization_id, definition, version, enabled, created_at, updated_at
                 FROM flows WHERE id = ?1",
                [id],
                Self::row_to_flow,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn get_flow_by_name(
        &self,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<FlowRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, name, organization_id, definition, version, enabled, created_at, updated_at
                 FROM flows WHERE organization_id = ?1 AND name = ?2",
                params![organization_id, name],
                Self::row_to_flow,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_flows(&self, organization_id: Option<&str>) -> Result<Vec<FlowRecord>> {
        let conn = self.conn.lock().await;
        let flows = match organization_id {
            Some(org) => {
                let mut stmt = conn.prepare(
                    "SELECT id, name, organization_id, definition, version, enabled, created_at, updated_at
                     FROM flows WHERE organization_id = ?1 ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([org], Self::row_to_flow)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, name, organization_id, definition, version, enabled, created_at, updated_at
                     FROM flows ORDER BY organization_id, name",
                )?;
                let rows = stmt
                    .query_map([], Self::row_to_flow)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(flows)
    }

    pub async fn delete_flow(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM flows WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("Flow not found: {}", id)));
        }
        Ok(())
    }

    pub async fn set_flow_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE flows SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Flow not found: {}", id)));
        }
        Ok(())
    }

    fn row_to_flow(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRecord> {
        Ok(FlowRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            organization_id: row.get(2)?,
            definition: row.get(3)?,
            version: row.get(4)?,
            enabled: row.get(5)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
        })
    }

    // ========================================================================
    // Flow state operations
    // ========================================================================

    pub async fn save_flow_state(&self, state: &ExecutionState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO flow_states
             (flow_id, subject_id, current_node_id, variables, status, step_count,
              execution_path, last_event_id, started_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(flow_id, subject_id) DO UPDATE SET
                current_node_id = excluded.current_node_id,
                variables = excluded.variables,
                status = excluded.status,
                step_count = excluded.step_count,
                execution_path = excluded.execution_path,
                last_event_id = excluded.last_event_id,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
            params![
                state.flow_id,
                state.subject_id,
                state.current_node_id,
                serde_json::to_string(&state.variables).unwrap_or_default(),
                state.status.to_string(),
                state.step_count,
                serde_json::to_string(&state.execution_path).unwrap_or_default(),
                state.last_event_id,
                state.started_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
                state.expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_flow_state(
        &self,
        flow_id: &str,
        subject_id: &str,
    ) -> Result<Option<ExecutionState>> {
        let conn = self.conn.lock().await;
        let state = conn
            .query_row(
                "SELECT flow_id, subject_id, current_node_id, variables, status, step_count,
                        execution_path, last_event_id, started_at, updated_at, expires_at
                 FROM flow_states WHERE flow_id = ?1 AND subject_id = ?2",
                params![flow_id, subject_id],
                Self::row_to_flow_state,
            )
            .optional()?;
        Ok(state)
    }

    pub async fn delete_flow_state(&self, flow_id: &str, subject_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM flow_states WHERE flow_id = ?1 AND subject_id = ?2",
            params![flow_id, subject_id],
        )?;
        Ok(())
    }

    /// Delete suspended states whose expiry has passed. Returns the number
    /// of rows removed.
    pub async fn purge_expired_states(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let purged = conn.execute(
            "DELETE FROM flow_states
             WHERE status = 'awaiting_input'
               AND expires_at IS NOT NULL
               AND expires_at <= ?1",
            [now.to_rfc3339()],
        )?;
        Ok(purged as u64)
    }

    fn row_to_flow_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionState> {
        let status_str: String = row.get(4)?;
        let status = status_str.parse().unwrap_or(FlowStatus::Failed);

        Ok(ExecutionState {
            flow_id: row.get(0)?,
            subject_id: row.get(1)?,
            current_node_id: row.get(2)?,
            variables: parse_json(&row.get::<_, String>(3)?)?,
            status,
            step_count: row.get(5)?,
            execution_path: parse_json(&row.get::<_, String>(6)?)?,
            last_event_id: row.get(7)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
            expires_at: row
                .get::<_, Option<String>>(10)?
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }

    // ========================================================================
    // Automation operations
    // ========================================================================

    pub async fn save_automation(&self, automation: &Automation) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO automations
             (id, organization_id, name, flow_id, audience, settings, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                organization_id = excluded.organization_id,
                name = excluded.name,
                flow_id = excluded.flow_id,
                audience = excluded.audience,
                settings = excluded.settings,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                automation.id,
                automation.organization_id,
                automation.name,
                automation.flow_id,
                serde_json::to_string(&automation.audience).unwrap_or_default(),
                serde_json::to_string(&automation.settings).unwrap_or_default(),
                automation.enabled,
                automation.created_at.to_rfc3339(),
                automation.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_automation(&self, id: &str) -> Result<Option<Automation>> {
        let conn = self.conn.lock().await;
        let automation = conn
            .query_row(
                "SELECT id, organization_id, name, flow_id, audience, settings, enabled, created_at, updated_at
                 FROM automations WHERE id = ?1",
                [id],
                Self::row_to_automation,
            )
            .optional()?;
        Ok(automation)
    }

    pub async fn list_automations(&self, organization_id: Option<&str>) -> Result<Vec<Automation>> {
        let conn = self.conn.lock().await;
        let automations = match organization_id {
            Some(org) => {
                let mut stmt = conn.prepare(
                    "SELECT id, organization_id, name, flow_id, audience, settings, enabled, created_at, updated_at
                     FROM automations WHERE organization_id = ?1 ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([org], Self::row_to_automation)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, organization_id, name, flow_id, audience, settings, enabled, created_at, updated_at
                     FROM automations ORDER BY organization_id, name",
                )?;
                let rows = stmt
                    .query_map([], Self::row_to_automation)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(automations)
    }

    pub async fn set_automation_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE automations SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Automation not found: {}", id)));
        }
        Ok(())
    }

    fn row_to_automation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Automation> {
        Ok(Automation {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            flow_id: row.get(3)?,
            audience: parse_json(&row.get::<_, String>(4)?)?,
            settings: parse_json(&row.get::<_, String>(5)?)?,
            enabled: row.get(6)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
        })
    }

    // ========================================================================
    // Schedule operations
    // ========================================================================

    /// Save a schedule. Lease columns are managed by claim/release only and
    /// survive an upsert.
    pub async fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedules
             (id, automation_id, recurrence, start_date, window_start, window_end, timezone,
              blackout_dates, skip_weekends, skip_holidays, is_paused,
              next_scheduled_at, last_executed_at, execution_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                automation_id = excluded.automation_id,
                recurrence = excluded.recurrence,
                start_date = excluded.start_date,
                window_start = excluded.window_start,
                window_end = excluded.window_end,
                timezone = excluded.timezone,
                blackout_dates = excluded.blackout_dates,
                skip_weekends = excluded.skip_weekends,
                skip_holidays = excluded.skip_holidays,
                is_paused = excluded.is_paused,
                next_scheduled_at = excluded.next_scheduled_at,
                last_executed_at = excluded.last_executed_at,
                execution_count = excluded.execution_count",
            params![
                schedule.id,
                schedule.automation_id,
                serde_json::to_string(&schedule.recurrence).unwrap_or_default(),
                schedule.start_date.to_string(),
                schedule.window.start_time.format("%H:%M:%S").to_string(),
                schedule.window.end_time.format("%H:%M:%S").to_string(),
                schedule.timezone,
                serde_json::to_string(&schedule.blackout_dates).unwrap_or_default(),
                schedule.skip_weekends,
                schedule.skip_holidays,
                schedule.is_paused,
                schedule.next_scheduled_at.map(|t| t.to_rfc3339()),
                schedule.last_executed_at.map(|t| t.to_rfc3339()),
                schedule.execution_count,
            ],
        )?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn.lock().await;
        let schedule = conn
            .query_row(
                "SELECT id, automation_id, recurrence, start_date, window_start, window_end,
                        timezone, blackout_dates, skip_weekends, skip_holidays, is_paused,
                        next_scheduled_at, last_executed_at, execution_count
                 FROM schedules WHERE id = ?1",
                [id],
                Self::row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    pub async fn list_schedules(&self, automation_id: Option<&str>) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().await;
        let schedules = match automation_id {
            Some(automation) => {
                let mut stmt = conn.prepare(
                    "SELECT id, automation_id, recurrence, start_date, window_start, window_end,
                            timezone, blackout_dates, skip_weekends, skip_holidays, is_paused,
                            next_scheduled_at, last_executed_at, execution_count
                     FROM schedules WHERE automation_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([automation], Self::row_to_schedule)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, automation_id, recurrence, start_date, window_start, window_end,
                            timezone, blackout_dates, skip_weekends, skip_holidays, is_paused,
                            next_scheduled_at, last_executed_at, execution_count
                     FROM schedules ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], Self::row_to_schedule)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(schedules)
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("Schedule not found: {}", id)));
        }
        Ok(())
    }

    /// Schedules ready to fire: unpaused, due, and not leased by a live
    /// owner.
    pub async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, automation_id, recurrence, start_date, window_start, window_end,
                    timezone, blackout_dates, skip_weekends, skip_holidays, is_paused,
                    next_scheduled_at, last_executed_at, execution_count
             FROM schedules
             WHERE is_paused = 0
               AND next_scheduled_at IS NOT NULL
               AND next_scheduled_at <= ?1
               AND (lease_until IS NULL OR lease_until <= ?1)
             ORDER BY next_scheduled_at
             LIMIT ?2",
        )?;

        let schedules = stmt
            .query_map(
                params![now.to_rfc3339(), limit.min(MAX_QUERY_LIMIT)],
                Self::row_to_schedule,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(schedules)
    }

    /// Take the firing lease on a schedule. The guarded update makes the
    /// claim atomic: of several pollers racing on the same due schedule,
    /// exactly one sees a row change.
    pub async fn claim_schedule(
        &self,
        id: &str,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let claimed = conn.execute(
            "UPDATE schedules
             SET lease_owner = ?2, lease_until = ?3
             WHERE id = ?1 AND (lease_until IS NULL OR lease_until <= ?4)",
            params![id, owner, lease_until.to_rfc3339(), now.to_rfc3339()],
        )?;
        Ok(claimed == 1)
    }

    /// Release a lease. A no-op when the lease moved to another owner in
    /// the meantime (expired and re-claimed).
    pub async fn release_schedule(&self, id: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedules
             SET lease_owner = NULL, lease_until = NULL
             WHERE id = ?1 AND lease_owner = ?2",
            params![id, owner],
        )?;
        Ok(())
    }

    /// Record one firing: bump the counter, stamp the execution time, and
    /// move the cursor to the next computed occurrence (or NULL when the
    /// recurrence is exhausted or broken).
    pub async fn mark_schedule_fired(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
        next_scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedules
             SET last_executed_at = ?2,
                 next_scheduled_at = ?3,
                 execution_count = execution_count + 1
             WHERE id = ?1",
            params![
                id,
                fired_at.to_rfc3339(),
                next_scheduled_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn set_schedule_next(
        &self,
        id: &str,
        next_scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedules SET next_scheduled_at = ?2 WHERE id = ?1",
            params![id, next_scheduled_at.map(|t| t.to_rfc3339())],
        )?;
        Ok(())
    }

    pub async fn set_schedule_paused(&self, id: &str, paused: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE schedules SET is_paused = ?2 WHERE id = ?1",
            params![id, paused],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Schedule not found: {}", id)));
        }
        Ok(())
    }

    fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
        let recurrence: Recurrence = parse_json(&row.get::<_, String>(2)?)?;
        let blackout_dates: Vec<NaiveDate> = parse_json(&row.get::<_, String>(7)?)?;

        Ok(Schedule {
            id: row.get(0)?,
            automation_id: row.get(1)?,
            recurrence,
            start_date: parse_date(&row.get::<_, String>(3)?)?,
            window: ScheduleWindow {
                start_time: parse_time(&row.get::<_, String>(4)?)?,
                end_time: parse_time(&row.get::<_, String>(5)?)?,
            },
            timezone: row.get(6)?,
            blackout_dates,
            skip_weekends: row.get(8)?,
            skip_holidays: row.get(9)?,
            is_paused: row.get(10)?,
            next_scheduled_at: row
                .get::<_, Option<String>>(11)?
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            last_executed_at: row
                .get::<_, Option<String>>(12)?
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            execution_count: row.get(13)?,
        })
    }

    // ========================================================================
    // Schedule exception operations
    // ========================================================================

    pub async fn save_exception(&self, exception: &ScheduleException) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedule_exceptions
             (id, schedule_id, kind, start_date, end_date, reschedule_to, modified_config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                schedule_id = excluded.schedule_id,
                kind = excluded.kind,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                reschedule_to = excluded.reschedule_to,
                modified_config = excluded.modified_config",
            params![
                exception.id,
                exception.schedule_id,
                exception.kind.to_string(),
                exception.start_date.to_string(),
                exception.end_date.to_string(),
                exception.reschedule_to.map(|t| t.to_rfc3339()),
                exception
                    .modified_config
                    .as_ref()
                    .map(|c| serde_json::to_string(c).unwrap_or_default()),
            ],
        )?;
        Ok(())
    }

    /// Exceptions for a schedule in listing order (start date, then id),
    /// the order first-match resolution runs in.
    pub async fn list_exceptions(&self, schedule_id: &str) -> Result<Vec<ScheduleException>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, schedule_id, kind, start_date, end_date, reschedule_to, modified_config
             FROM schedule_exceptions
             WHERE schedule_id = ?1
             ORDER BY start_date, id",
        )?;

        let exceptions = stmt
            .query_map([schedule_id], Self::row_to_exception)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(exceptions)
    }

    pub async fn delete_exception(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM schedule_exceptions WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("Exception not found: {}", id)));
        }
        Ok(())
    }

    fn row_to_exception(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleException> {
        let kind_str: String = row.get(2)?;
        let kind = kind_str.parse().unwrap_or(ExceptionKind::Skip);
        let modified_config: Option<String> = row.get(6)?;

        Ok(ScheduleException {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            kind,
            start_date: parse_date(&row.get::<_, String>(3)?)?,
            end_date: parse_date(&row.get::<_, String>(4)?)?,
            reschedule_to: row
                .get::<_, Option<String>>(5)?
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            modified_config: modified_config.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    pub async fn save_execution(&self, execution: &AutomationExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO executions
             (id, automation_id, flow_id, status, scheduled_for, overrides, stats, started_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                automation_id = excluded.automation_id,
                flow_id = excluded.flow_id,
                status = excluded.status,
                scheduled_for = excluded.scheduled_for,
                overrides = excluded.overrides,
                stats = excluded.stats,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                error = excluded.error",
            params![
                execution.id,
                execution.automation_id,
                execution.flow_id,
                execution.status.to_string(),
                execution.scheduled_for.map(|t| t.to_rfc3339()),
                execution
                    .overrides
                    .as_ref()
                    .map(|o| serde_json::to_string(o).unwrap_or_default()),
                serde_json::to_string(&execution.stats).unwrap_or_default(),
                execution.started_at.to_rfc3339(),
                execution.finished_at.map(|t| t.to_rfc3339()),
                execution.error,
            ],
        )?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<AutomationExecution>> {
        let conn = self.conn.lock().await;
        let execution = conn
            .query_row(
                "SELECT id, automation_id, flow_id, status, scheduled_for, overrides, stats, started_at, finished_at, error
                 FROM executions WHERE id = ?1",
                [id],
                Self::row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    /// Pending executions whose fire time has arrived. Manually triggered
    /// rows carry no `scheduled_for` and are due immediately.
    pub async fn due_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AutomationExecution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, automation_id, flow_id, status, scheduled_for, overrides, stats, started_at, finished_at, error
             FROM executions
             WHERE status = 'pending'
               AND (scheduled_for IS NULL OR scheduled_for <= ?1)
             ORDER BY COALESCE(scheduled_for, started_at)
             LIMIT ?2",
        )?;

        let executions = stmt
            .query_map(
                params![now.to_rfc3339(), limit.min(MAX_QUERY_LIMIT)],
                Self::row_to_execution,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(executions)
    }

    /// Move a pending execution to running. The guarded update lets exactly
    /// one of several racing dispatchers win the row.
    pub async fn claim_execution(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let claimed = conn.execute(
            "UPDATE executions SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        Ok(claimed == 1)
    }

    pub async fn query_executions(&self, query: &ExecutionQuery) -> Result<Vec<AutomationExecution>> {
        let conn = self.conn.lock().await;

        let mut sql = String::from(
            "SELECT id, automation_id, flow_id, status, scheduled_for, overrides, stats, started_at, finished_at, error
             FROM executions WHERE 1=1",
        );
        let mut sql_params: Vec<SqlValue> = Vec::new();

        if let Some(automation_id) = &query.automation_id {
            sql.push_str(&format!(" AND automation_id = ?{}", sql_params.len() + 1));
            sql_params.push(SqlValue::Text(automation_id.clone()));
        }
        if let Some(status) = query.status {
            sql.push_str(&format!(" AND status = ?{}", sql_params.len() + 1));
            sql_params.push(SqlValue::Text(status.to_string()));
        }

        let limit = query.limit.min(MAX_QUERY_LIMIT);
        sql.push_str(&format!(
            " ORDER BY started_at DESC LIMIT ?{} OFFSET ?{}",
            sql_params.len() + 1,
            sql_params.len() + 2
        ));
        sql_params.push(SqlValue::Integer(limit as i64));
        sql_params.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(params_from_iter(sql_params), Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(executions)
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutomationExecution> {
        let status_str: String = row.get(3)?;
        let status = status_str.parse().unwrap_or(ExecutionStatus::Failed);
        let overrides: Option<String> = row.get(5)?;

        Ok(AutomationExecution {
            id: row.get(0)?,
            automation_id: row.get(1)?,
            flow_id: row.get(2)?,
            status,
            scheduled_for: row
                .get::<_, Option<String>>(4)?
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            overrides: overrides.and_then(|s| serde_json::from_str(&s).ok()),
            stats: parse_json(&row.get::<_, String>(6)?)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            finished_at: row
                .get::<_, Option<String>>(8)?
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            error: row.get(9)?,
        })
    }

    // ========================================================================
    // Recipient operations
    // ========================================================================

    pub async fn save_recipient(&self, recipient: &RecipientRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO recipients
             (id, execution_id, subject_id, status, retry_count, message_id, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                execution_id = excluded.execution_id,
                subject_id = excluded.subject_id,
                status = excluded.status,
                retry_count = excluded.retry_count,
                message_id = excluded.message_id,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                recipient.id,
                recipient.execution_id,
                recipient.subject_id,
                recipient.status.to_string(),
                recipient.retry_count,
                recipient.message_id,
                recipient.last_error,
                recipient.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_recipients(&self, execution_id: &str) -> Result<Vec<RecipientRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, subject_id, status, retry_count, message_id, last_error, updated_at
             FROM recipients WHERE execution_id = ?1 ORDER BY subject_id",
        )?;

        let recipients = stmt
            .query_map([execution_id], Self::row_to_recipient)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(recipients)
    }

    /// Apply a delivery or read receipt to whichever recipient owns the
    /// gateway message id. Status only moves forward through
    /// sent -> delivered -> read; a late "delivered" after "read" is
    /// dropped. Returns the updated record, or None when the message id is
    /// unknown or the receipt is stale.
    pub async fn record_delivery_receipt(
        &self,
        message_id: &str,
        receipt_status: RecipientStatus,
    ) -> Result<Option<RecipientRecord>> {
        let Some(new_rank) = delivery_rank(receipt_status) else {
            return Err(Error::Validation(format!(
                "Invalid receipt status: {}",
                receipt_status
            )));
        };

        let conn = self.conn.lock().await;
        let recipient = conn
            .query_row(
                "SELECT id, execution_id, subject_id, status, retry_count, message_id, last_error, updated_at
                 FROM recipients WHERE message_id = ?1",
                [message_id],
                Self::row_to_recipient,
            )
            .optional()?;

        let Some(mut recipient) = recipient else {
            return Ok(None);
        };
        let Some(current_rank) = delivery_rank(recipient.status) else {
            // Terminal flow statuses (completed/failed/cancelled) outrank
            // delivery receipts.
            return Ok(None);
        };
        if new_rank <= current_rank {
            return Ok(None);
        }

        recipient.status = receipt_status;
        recipient.updated_at = Utc::now();
        conn.execute(
            "UPDATE recipients SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                recipient.id,
                recipient.status.to_string(),
                recipient.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(Some(recipient))
    }

    /// Reduce recipient rows into the execution's stats counters and
    /// persist them. Delivery stages are cumulative (a read message was
    /// also delivered and sent); completed and failed are flow-terminal
    /// counts.
    pub async fn refresh_execution_stats(&self, execution_id: &str) -> Result<ExecutionStats> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM recipients WHERE execution_id = ?1 GROUP BY status",
        )?;

        let counts = stmt
            .query_map([execution_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stats = ExecutionStats::default();
        for (status_str, count) in counts {
            let count = count.max(0) as u64;
            stats.total += count;
            match status_str.parse().unwrap_or(RecipientStatus::Failed) {
                RecipientStatus::Sent => stats.sent += count,
                RecipientStatus::Delivered => {
                    stats.sent += count;
                    stats.delivered += count;
                }
                RecipientStatus::Read => {
                    stats.sent += count;
                    stats.delivered += count;
                    stats.read += count;
                }
                RecipientStatus::Completed => {
                    stats.sent += count;
                    stats.completed += count;
                }
                RecipientStatus::Failed => stats.failed += count,
                RecipientStatus::Pending | RecipientStatus::Cancelled => {}
            }
        }

        conn.execute(
            "UPDATE executions SET stats = ?2 WHERE id = ?1",
            params![
                execution_id,
                serde_json::to_string(&stats).unwrap_or_default(),
            ],
        )?;

        Ok(stats)
    }

    fn row_to_recipient(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipientRecord> {
        let status_str: String = row.get(3)?;
        let status = status_str.parse().unwrap_or(RecipientStatus::Failed);

        Ok(RecipientRecord {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            subject_id: row.get(2)?,
            status,
            retry_count: row.get(4)?,
            message_id: row.get(5)?,
            last_error: row.get(6)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
        })
    }
}

/// Position in the delivery receipt ladder, None for statuses receipts
/// cannot move.
fn delivery_rank(status: RecipientStatus) -> Option<u8> {
    match status {
        RecipientStatus::Sent => Some(0),
        RecipientStatus::Delivered => Some(1),
        RecipientStatus::Read => Some(2),
        RecipientStatus::Pending
        | RecipientStatus::Completed
        | RecipientStatus::Failed
        | RecipientStatus::Cancelled => None,
    }
}
