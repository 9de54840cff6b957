//! Conversation engine: interpreter, per-subject locking, and the
//! service seam that ties turns to delivery and persistence.

mod interpreter;
mod locks;
mod service;

pub use interpreter::{Interpreter, TurnOutcome, MAX_STEPS_PER_TURN};
pub use locks::SubjectLocks;
pub use service::{EngineTurn, FlowEngine, InboundEvent};
