//! Storage models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::AudienceSpec;

/// Stored flow record. The definition is kept verbatim as authored (YAML
/// or JSON) and parsed on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub definition: String,
    pub version: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of one subject's walk through a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    AwaitingInput,
    Completed,
    Failed,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::AwaitingInput => write!(f, "awaiting_input"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "awaiting_input" => Ok(Self::AwaitingInput),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Per-subject interpreter state. One row per (flow, subject); suspension
/// at a question node persists this and resumption rehydrates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub flow_id: String,
    pub subject_id: String,
    pub current_node_id: String,
    pub variables: HashMap<String, serde_json::Value>,
    pub status: FlowStatus,
    pub step_count: u32,
    pub execution_path: Vec<String>,
    /// Last inbound event applied, for replay detection.
    pub last_event_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Suspended states past this instant are eligible for purging.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn new(flow_id: &str, subject_id: &str, start_node_id: &str) -> Self {
        let now = Utc::now();
        Self {
            flow_id: flow_id.to_string(),
            subject_id: subject_id.to_string(),
            current_node_id: start_node_id.to_string(),
            variables: HashMap::new(),
            status: FlowStatus::Active,
            step_count: 0,
            execution_path: Vec::new(),
            last_event_id: None,
            started_at: now,
            updated_at: now,
            expires_at: None,
        }
    }
}

/// Retry behavior for transient delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    60
}

fn default_max_delay() -> u64 {
    3600
}

/// Throughput controls for one automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_hour: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_hour: default_rate_limit(),
            max_concurrent: default_max_concurrent(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_rate_limit() -> u32 {
    600
}

fn default_max_concurrent() -> u32 {
    10
}

/// One-occurrence settings overlay attached to a modify exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOverrides {
    pub rate_limit_per_hour: Option<u32>,
    pub max_concurrent: Option<u32>,
}

impl DispatchOverrides {
    /// Overlay onto base settings. Unset fields keep the base value; the
    /// retry policy is never overridable per occurrence.
    pub fn apply(&self, base: &DispatchSettings) -> DispatchSettings {
        DispatchSettings {
            rate_limit_per_hour: self.rate_limit_per_hour.unwrap_or(base.rate_limit_per_hour),
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            retry: base.retry,
        }
    }
}

/// An automation binds a flow to an audience with dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub flow_id: String,
    pub audience: AudienceSpec,
    #[serde(default)]
    pub settings: DispatchSettings,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Batch execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Aggregated per-recipient outcomes for one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub completed: u64,
    pub failed: u64,
}

/// One batch run of an automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationExecution {
    pub id: String,
    pub automation_id: String,
    pub flow_id: String,
    pub status: ExecutionStatus,
    /// Occurrence instant for scheduled runs, None for manual triggers.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Settings overlay carried from a modify exception, applied at
    /// dispatch time.
    #[serde(default)]
    pub overrides: Option<DispatchOverrides>,
    pub stats: ExecutionStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Per-recipient delivery progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read => write!(f, "read"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RecipientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Per-recipient record within a batch execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: String,
    pub execution_id: String,
    pub subject_id: String,
    pub status: RecipientStatus,
    pub retry_count: u32,
    /// Gateway message id of the last send, keyed by delivery receipts.
    pub message_id: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Query filters for execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub automation_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            automation_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}
