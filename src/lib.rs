//! flowcast - Flow automation engine for conversational messaging
//!
//! flowcast drives subscriber conversations through versioned flow graphs:
//! an interpreter walks message, question, condition, and end nodes one
//! turn at a time, suspending whenever a question waits on a reply; a
//! recurrence scheduler fires automations on calendars with per-occurrence
//! exceptions; a dispatcher fans a fired automation out to its audience
//! under a token-bucket rate limit with retry and cancellation.
//!
//! ## Example
//!
//! ```yaml
//! name: onboarding
//! description: Welcome new subscribers and capture their age
//! organization_id: org-1
//! start_node_id: entry
//!
//! nodes:
//!   - id: entry
//!     type: start
//!     next_node_ids: [greet]
//!
//!   - id: greet
//!     type: message
//!     config:
//!       text: "Hi {{name}}, welcome aboard!"
//!     next_node_ids: [ask-age]
//!
//!   - id: ask-age
//!     type: question
//!     config:
//!       prompt: "How old are you?"
//!       variable: age
//!       validation: numeric
//!     next_node_ids: [finish]
//!
//!   - id: finish
//!     type: end
//!     config:
//!       message: "All set, talk soon."
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod metrics;
pub mod nodes;
pub mod schedule;
pub mod shutdown;
pub mod storage;

pub use error::{Error, Result};
