//! Flow interpreter.
//!
//! Walks a parsed flow graph one turn at a time. A turn runs from the
//! current node until the flow completes, suspends at a question, or hits
//! the step cap. Handlers are synchronous; everything they produce
//! (messages, post-actions) is collected on the turn and delivered by the
//! caller.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::flow::FlowDefinition;
use crate::metrics;
use crate::nodes::{NodeAction, NodeRegistry, OutboundMessage, PostAction, Turn};
use crate::storage::{ExecutionState, FlowStatus};

/// Hard cap on node executions within a single turn. A graph cycle with no
/// question node in it hits this instead of spinning forever; that is an
/// authoring bug and fails the run.
pub const MAX_STEPS_PER_TURN: u32 = 100;

/// What one turn produced.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    pub outbound: Vec<OutboundMessage>,
    pub actions: Vec<PostAction>,
    /// True when the flow stopped at a question and waits for input.
    pub suspended: bool,
}

/// Executes flow turns against per-subject state.
#[derive(Clone)]
pub struct Interpreter {
    registry: Arc<NodeRegistry>,
}

impl Interpreter {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Run one turn. `input` is the subject's reply when resuming a
    /// suspended state; the first question node consumes it.
    ///
    /// On error the state is marked failed; variables accumulated before
    /// the failing node are kept so the stored state reflects how far the
    /// run got.
    pub fn run_turn(
        &self,
        flow: &FlowDefinition,
        state: &mut ExecutionState,
        input: Option<String>,
    ) -> Result<TurnOutcome> {
        if matches!(state.status, FlowStatus::Completed | FlowStatus::Failed) {
            return Err(Error::Execution(format!(
                "Flow run for subject '{}' already finished with status '{}'",
                state.subject_id, state.status
            )));
        }

        let mut turn = Turn::new(std::mem::take(&mut state.variables), input);
        let outcome = self.drive(flow, state, &mut turn);
        state.variables = std::mem::take(&mut turn.variables);
        state.updated_at = Utc::now();

        match outcome {
            Ok(suspended) => Ok(TurnOutcome {
                outbound: std::mem::take(&mut turn.outbound),
                actions: std::mem::take(&mut turn.actions),
                suspended,
            }),
            Err(e) => {
                state.status = FlowStatus::Failed;
                Err(e)
            }
        }
    }

    /// The step loop. Returns whether the turn ended suspended.
    ///
    /// The execution path records nodes the flow moved past; a suspending
    /// question is appended only once it finally advances, so an invalid
    /// reply (re-prompt, stay suspended) leaves the path untouched.
    fn drive(
        &self,
        flow: &FlowDefinition,
        state: &mut ExecutionState,
        turn: &mut Turn,
    ) -> Result<bool> {
        for _ in 0..MAX_STEPS_PER_TURN {
            let node = flow.get_node(&state.current_node_id).ok_or_else(|| {
                Error::Execution(format!("Node not found: {}", state.current_node_id))
            })?;

            let action = self.registry.execute(node, turn)?;
            state.step_count = state.step_count.saturating_add(1);
            metrics::record_flow_step(&node.node_type);

            match action {
                NodeAction::Advance(next) => {
                    state.execution_path.push(node.id.clone());
                    state.current_node_id = next;
                    state.status = FlowStatus::Active;
                }
                NodeAction::Suspend => {
                    state.status = FlowStatus::AwaitingInput;
                    return Ok(true);
                }
                NodeAction::Complete => {
                    state.execution_path.push(node.id.clone());
                    state.status = FlowStatus::Completed;
                    return Ok(false);
                }
            }
        }

        Err(Error::FlowLoopLimit(MAX_STEPS_PER_TURN))
    }
}
