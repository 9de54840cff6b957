//! Storage layer for flows, schedules, and executions.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
