//! Batch dispatch: rate-limited, retrying fan-out of automation
//! executions to their recipients.

mod cancel;
mod orchestrator;
mod rate_limit;

pub use cancel::CancelRegistry;
pub use orchestrator::Dispatcher;
pub use rate_limit::TokenBucket;
