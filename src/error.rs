//! Error types for flowcast.
//!
//! Every variant carries a stable machine-readable code so callers can
//! branch on failures without string matching.

use thiserror::Error;

use crate::gateway::GatewayError;

/// Result type alias for flowcast operations.
pub type Result<T> = std::result::Result<T, Error>;

/// flowcast error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed flow or schedule configuration, rejected at save time.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A run hit something the graph promised could not happen: unknown
    /// node id, unregistered node type, missing config field.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The interpreter's iteration cap tripped on a cyclic flow.
    #[error("Flow loop limit exceeded after {0} iterations")]
    FlowLoopLimit(u32),

    /// Outbound delivery failure, classified transient or permanent.
    #[error("Delivery error: {0}")]
    Delivery(#[from] GatewayError),

    /// Occurrence computation failed (non-converging filters, bad stored
    /// recurrence). The schedule is parked rather than mis-fired.
    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::FlowLoopLimit(_) => "FLOW_LOOP_LIMIT_EXCEEDED",
            Error::Delivery(GatewayError::Transient(_)) => "DELIVERY_TRANSIENT",
            Error::Delivery(GatewayError::Permanent(_)) => "DELIVERY_PERMANENT",
            Error::Schedule(_) => "SCHEDULE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Delivery(GatewayError::Transient(_)))
    }
}
