//! Node implementations.
//!
//! Nodes are the building blocks of conversation flows. Each node type is
//! one conversational move: say something, ask something, branch, stop.

mod condition;
mod end;
pub mod interpolate;
mod message;
mod question;
mod registry;
mod start;
mod types;

pub use condition::ConditionNode;
pub use end::EndNode;
pub use interpolate::render_text;
pub use message::MessageNode;
pub use question::QuestionNode;
pub use registry::NodeRegistry;
pub use start::StartNode;
pub use types::{NodeAction, NodeHandler, OutboundMessage, PostAction, Turn};
