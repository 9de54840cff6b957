//! Flow engine service.
//!
//! Owns the read-run-deliver-persist cycle around the interpreter. Every
//! entry point serializes on the (flow, subject) pair, so two events for
//! the same conversation can never interleave.
//!
//! Persistence comes after delivery: if the gateway rejects a message the
//! state is not saved and a redelivered event replays the whole turn.
//! Messages sent before the failure go out again on the replay, which is
//! the at-least-once contract of the channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::interpreter::Interpreter;
use crate::error::{Error, Result};
use crate::flow::{parse_flow, FlowDefinition};
use crate::gateway::{DeliveryReceipt, MessageGateway};
use crate::metrics;
use crate::nodes::{NodeRegistry, OutboundMessage, PostAction};
use crate::storage::{ExecutionState, FlowRecord, FlowStatus, SqliteStorage};

use super::locks::SubjectLocks;

/// An inbound message event from a channel adapter.
///
/// `event_id` is the channel's delivery id; it powers the replay guard.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub event_id: String,
    pub flow_id: String,
    pub subject_id: String,
    pub text: String,
}

/// What one engine entry point produced: the turn's output plus channel
/// receipts for the messages that actually went out.
#[derive(Debug, Default)]
pub struct EngineTurn {
    pub outbound: Vec<OutboundMessage>,
    pub actions: Vec<PostAction>,
    pub suspended: bool,
    pub receipts: Vec<DeliveryReceipt>,
}

/// The conversational engine: interpreter plus its collaborators.
#[derive(Clone)]
pub struct FlowEngine {
    storage: SqliteStorage,
    interpreter: Interpreter,
    gateway: Arc<dyn MessageGateway>,
    locks: SubjectLocks,
    state_ttl: Option<Duration>,
}

impl FlowEngine {
    pub fn new(storage: SqliteStorage, gateway: Arc<dyn MessageGateway>) -> Self {
        Self {
            storage,
            interpreter: Interpreter::new(Arc::new(NodeRegistry::new())),
            gateway,
            locks: SubjectLocks::new(),
            state_ttl: None,
        }
    }

    /// Replace the node registry (embedding scenarios register extra types).
    pub fn with_registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.interpreter = Interpreter::new(registry);
        self
    }

    /// Expire suspended conversations after `ttl` of silence. Unset means
    /// they wait forever.
    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = Some(ttl);
        self
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// Load a flow record and parse its stored definition.
    pub async fn load_flow(&self, flow_id: &str) -> Result<(FlowRecord, FlowDefinition)> {
        let record = self
            .storage
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Flow not found: {}", flow_id)))?;
        if !record.enabled {
            return Err(Error::Execution(format!("Flow '{}' is disabled", record.name)));
        }
        let definition = parse_flow(&record.definition)?;
        Ok((record, definition))
    }

    /// Process one inbound event.
    ///
    /// An awaiting-input conversation resumes with the event text as the
    /// answer. Anything else (no state, or a finished run) starts a fresh
    /// run; the triggering text is treated as the trigger, not as input to
    /// the first question.
    pub async fn handle_inbound(&self, event: &InboundEvent) -> Result<EngineTurn> {
        let (record, definition) = self.load_flow(&event.flow_id).await?;
        let _guard = self.locks.acquire(&record.id, &event.subject_id).await;

        let existing = self
            .storage
            .get_flow_state(&record.id, &event.subject_id)
            .await?;

        // Replay guard. A redelivered event must not advance the flow a
        // second time, and must not restart a run it already finished.
        if let Some(state) = &existing {
            if state.last_event_id.as_deref() == Some(event.event_id.as_str()) {
                debug!(
                    event_id = %event.event_id,
                    subject_id = %event.subject_id,
                    "duplicate inbound event ignored"
                );
                return Ok(EngineTurn {
                    suspended: state.status == FlowStatus::AwaitingInput,
                    ..EngineTurn::default()
                });
            }
        }

        let (state, input) = match existing {
            Some(state) if state.status == FlowStatus::AwaitingInput => {
                (state, Some(event.text.clone()))
            }
            _ => (
                ExecutionState::new(&record.id, &event.subject_id, &definition.start_node_id),
                None,
            ),
        };

        self.complete_turn(&definition, state, input, Some(&event.event_id))
            .await
    }

    /// Start a fresh run for one subject, discarding any previous state.
    /// `variables` seeds the conversation (contact attributes and the like).
    pub async fn start_flow(
        &self,
        flow_id: &str,
        subject_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<EngineTurn> {
        let (record, definition) = self.load_flow(flow_id).await?;
        self.start_flow_parsed(&record.id, &definition, subject_id, variables)
            .await
    }

    /// `start_flow` for callers that already hold the parsed definition.
    /// Batch dispatch parses once and fans out through here.
    pub async fn start_flow_parsed(
        &self,
        flow_id: &str,
        definition: &FlowDefinition,
        subject_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<EngineTurn> {
        let _guard = self.locks.acquire(flow_id, subject_id).await;

        let mut state = ExecutionState::new(flow_id, subject_id, &definition.start_node_id);
        state.variables = variables;

        self.complete_turn(definition, state, None, None).await
    }

    /// Run the turn, deliver its messages, persist the state.
    async fn complete_turn(
        &self,
        definition: &FlowDefinition,
        mut state: ExecutionState,
        input: Option<String>,
        event_id: Option<&str>,
    ) -> Result<EngineTurn> {
        let outcome = match self.interpreter.run_turn(definition, &mut state, input) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Record the failure so the next event restarts cleanly
                // instead of resuming a poisoned run.
                if let Some(id) = event_id {
                    state.last_event_id = Some(id.to_string());
                }
                state.expires_at = None;
                self.storage.save_flow_state(&state).await?;
                metrics::record_flow_turn("failed");
                warn!(
                    flow_id = %state.flow_id,
                    subject_id = %state.subject_id,
                    error = %e,
                    "flow turn failed"
                );
                return Err(e);
            }
        };

        let mut receipts = Vec::with_capacity(outcome.outbound.len());
        for message in &outcome.outbound {
            receipts.push(self.gateway.send(&state.subject_id, &message.text).await?);
            metrics::record_message_sent();
        }

        if let Some(id) = event_id {
            state.last_event_id = Some(id.to_string());
        }
        state.expires_at = if outcome.suspended {
            self.state_ttl.map(|ttl| Utc::now() + ttl)
        } else {
            None
        };
        self.storage.save_flow_state(&state).await?;

        metrics::record_flow_turn(if outcome.suspended { "suspended" } else { "completed" });
        Ok(EngineTurn {
            outbound: outcome.outbound,
            actions: outcome.actions,
            suspended: outcome.suspended,
            receipts,
        })
    }

    /// Drop awaiting-input states whose expiry passed, and prune idle
    /// subject locks. Runs from the scheduler's maintenance sweep.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.storage.purge_expired_states(Utc::now()).await?;
        self.locks.prune().await;
        if purged > 0 {
            info!(purged, "expired awaiting-input conversations dropped");
            metrics::record_purged_states(purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::MockGateway;
    use crate::gateway::GatewayError;
    use crate::storage::FlowRecord;
    use serde_json::json;

    const ONBOARDING_YAML: &str = r#"
name: onboarding
organization_id: org-1
start_node_id: n0
nodes:
  - id: n0
    type: start
    next_node_ids: [n1]
  - id: n1
    type: message
    config:
      text: "Hi {{name}}"
    next_node_ids: [n2]
  - id: n2
    type: question
    config:
      prompt: "How old are you?"
      variable: age
      validation: numeric
    next_node_ids: [n3]
  - id: n3
    type: condition
    config:
      field: age
      op: ">"
      value: 18
      true_next: end_adult
      false_next: end_minor
  - id: end_adult
    type: end
    config:
      message: "Welcome aboard"
  - id: end_minor
    type: end
    config:
      message: "See you soon"
"#;

    async fn seeded_engine(gateway: Arc<MockGateway>) -> (FlowEngine, String) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let record = storage
            .save_flow(&FlowRecord {
                id: "fl-onboarding".to_string(),
                name: "onboarding".to_string(),
                organization_id: "org-1".to_string(),
                definition: ONBOARDING_YAML.to_string(),
                version: 1,
                enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        (FlowEngine::new(storage, gateway), record.id)
    }

    fn event(id: &str, flow_id: &str, text: &str) -> InboundEvent {
        InboundEvent {
            event_id: id.to_string(),
            flow_id: flow_id.to_string(),
            subject_id: "subject-1".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_inbound_conversation_runs_end_to_end() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;

        let first = engine.handle_inbound(&event("ev-1", &flow_id, "hello")).await.unwrap();
        assert!(first.suspended);
        assert_eq!(first.receipts.len(), 2);
        assert_eq!(
            gateway.sent_to("subject-1"),
            vec!["Hi ".to_string(), "How old are you?".to_string()]
        );

        let second = engine.handle_inbound(&event("ev-2", &flow_id, "25")).await.unwrap();
        assert!(!second.suspended);
        assert_eq!(second.outbound[0].text, "Welcome aboard");

        let state = engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, FlowStatus::Completed);
        assert_eq!(state.variables["age"], json!(25));
    }

    #[tokio::test]
    async fn test_replayed_event_does_not_advance() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;

        engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap();
        let sends_before = gateway.sent().len();
        let path_before = engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .unwrap()
            .execution_path;

        let replay = engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap();

        assert!(replay.suspended);
        assert!(replay.outbound.is_empty());
        assert_eq!(gateway.sent().len(), sends_before);
        let state = engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.execution_path, path_before);
    }

    #[tokio::test]
    async fn test_replayed_completing_event_does_not_restart() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;

        engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap();
        engine.handle_inbound(&event("ev-2", &flow_id, "30")).await.unwrap();
        let sends_before = gateway.sent().len();

        let replay = engine.handle_inbound(&event("ev-2", &flow_id, "30")).await.unwrap();

        assert!(!replay.suspended);
        assert_eq!(gateway.sent().len(), sends_before);
        let state = engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn test_new_event_after_completion_restarts_the_flow() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;

        engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap();
        engine.handle_inbound(&event("ev-2", &flow_id, "30")).await.unwrap();

        let third = engine.handle_inbound(&event("ev-3", &flow_id, "hi again")).await.unwrap();

        assert!(third.suspended);
        let state = engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, FlowStatus::AwaitingInput);
        assert_eq!(state.execution_path, vec!["n0", "n1"]);
    }

    #[tokio::test]
    async fn test_send_failure_leaves_state_unpersisted() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;
        gateway.fail_next("subject-1", GatewayError::Transient("channel down".to_string()));

        let err = engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .is_none());

        // Redelivery replays the turn and succeeds.
        let retry = engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap();
        assert!(retry.suspended);
    }

    #[tokio::test]
    async fn test_start_flow_seeds_variables_and_resets_state() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;

        engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap();

        let mut vars = HashMap::new();
        vars.insert("name".to_string(), json!("Ana"));
        let turn = engine.start_flow(&flow_id, "subject-1", vars).await.unwrap();

        assert!(turn.suspended);
        assert_eq!(turn.outbound[0].text, "Hi Ana");
        let state = engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.execution_path, vec!["n0", "n1"]);
        assert_eq!(state.variables["name"], json!("Ana"));
    }

    #[tokio::test]
    async fn test_suspension_ttl_sets_expiry() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;
        let engine = engine.with_state_ttl(Duration::hours(48));

        engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap();

        let state = engine
            .storage
            .get_flow_state(&flow_id, "subject-1")
            .await
            .unwrap()
            .unwrap();
        let expires = state.expires_at.unwrap();
        assert!(expires > Utc::now() + Duration::hours(47));
        assert!(expires <= Utc::now() + Duration::hours(48));
    }

    #[tokio::test]
    async fn test_disabled_flow_rejects_events() {
        let gateway = MockGateway::new();
        let (engine, flow_id) = seeded_engine(gateway.clone()).await;
        engine.storage.set_flow_enabled(&flow_id, false).await.unwrap();

        let err = engine.handle_inbound(&event("ev-1", &flow_id, "hi")).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");
        assert!(gateway.sent().is_empty());
    }
}
