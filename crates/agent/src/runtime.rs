//! Turn orchestration
//!
//! A turn runs extract, plan, execute, synthesize and escalate in that
//! order. The conversation is checkpointed after each of the first three
//! stages and again when the turn completes. A turn that is retried with the
//! same message picks up after its last checkpoint instead of starting over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clerk_core::config::{AppConfig, LlmProvider, SynthesisMode};
use clerk_core::domain::conversation::{
    CompletedTurn, ConversationId, ConversationState, PendingTurn, TurnStage,
};
use clerk_core::domain::plan::Plan;
use clerk_core::domain::tool::ToolResult;
use clerk_core::errors::{OrchestrationError, StoreError};
use clerk_core::store::{load_or_new, CheckpointRecord, ConversationStore};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::escalation::{EscalationDecision, EscalationPolicy, EscalationSignals};
use crate::executor::ToolExecutor;
use crate::extractor::Extractor;
use crate::llm::LlmClient;
use crate::planner::{PlanRequest, Planner};
use crate::synthesizer::{SynthesisInput, Synthesizer};
use crate::tools::{ShopBackend, ToolRegistry};

/// What the caller gets back for one user message.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub conversation_id: ConversationId,
    pub correlation_id: String,
    pub reply: String,
    pub confidence: f64,
    pub requires_clarification: bool,
    /// This turn escalated, or an earlier one already did.
    pub escalate: bool,
    pub escalation_reason: Option<String>,
    /// The turn continued from a checkpoint left by an interrupted attempt.
    pub resumed: bool,
    pub plan: Plan,
    pub results: Vec<ToolResult>,
    /// Failures folded into the reply, in the order they happened.
    pub recovered: Vec<OrchestrationError>,
    pub state: ConversationState,
}

type TurnLocks = Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>;

/// A conversation's turn lock, dropped from the map once nobody else holds it.
struct LockLease<'a> {
    locks: &'a TurnLocks,
    id: ConversationId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The map's reference plus this lease.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.id);
        }
    }
}

pub struct AgentRuntime {
    extractor: Extractor,
    planner: Planner,
    executor: ToolExecutor,
    synthesizer: Synthesizer,
    escalation: EscalationPolicy,
    store: Arc<dyn ConversationStore>,
    recent_turns: usize,
    locks: TurnLocks,
}

impl AgentRuntime {
    pub fn new(
        extractor: Extractor,
        planner: Planner,
        executor: ToolExecutor,
        synthesizer: Synthesizer,
        escalation: EscalationPolicy,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            extractor,
            planner,
            executor,
            synthesizer,
            escalation,
            store,
            recent_turns: 4,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wires every stage from configuration. With the offline provider the
    /// model extraction strategy is skipped and replies use templates.
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        backend: Arc<dyn ShopBackend>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let offline = config.llm.provider == LlmProvider::Offline;
        let registry = Arc::new(ToolRegistry::shop(backend));

        let extraction_llm = (config.extraction.model_strategy && !offline).then(|| llm.clone());
        let extractor = Extractor::standard(
            extraction_llm,
            Duration::from_millis(config.extraction.strategy_timeout_ms),
        );
        let planner = Planner::new(llm.clone(), registry.clone(), config.planner.heuristic_fallback)
            .with_timeout(Duration::from_millis(config.planner.timeout_ms));
        let executor = ToolExecutor::from_config(config, registry);
        let mode = if offline { SynthesisMode::Template } else { config.synthesis.mode };
        let synthesizer = Synthesizer::new(llm, mode)
            .with_timeout(Duration::from_millis(config.synthesis.timeout_ms));

        let mut runtime = Self::new(
            extractor,
            planner,
            executor,
            synthesizer,
            EscalationPolicy::from(&config.escalation),
            store,
        );
        runtime.recent_turns = config.planner.recent_turns;
        runtime
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.executor.registry()
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub async fn state(&self, id: &ConversationId) -> Result<Option<ConversationState>, StoreError> {
        self.store.load(id).await
    }

    pub async fn history(&self, id: &ConversationId) -> Result<Vec<CheckpointRecord>, StoreError> {
        self.store.history(id).await
    }

    fn conversation_lock(&self, id: &ConversationId) -> LockLease<'_> {
        let lock = self.locks.lock().entry(id.clone()).or_default().clone();
        LockLease { locks: &self.locks, id: id.clone(), lock }
    }

    /// Conversations with a turn running or waiting to run.
    pub fn active_conversations(&self) -> usize {
        self.locks.lock().len()
    }

    /// Handles one user message. Turns for the same conversation are
    /// serialized; different conversations run independently. Only a state
    /// store failure is returned as an error, everything else is folded into
    /// the reply.
    pub async fn handle_turn(
        &self,
        conversation_id: &ConversationId,
        message: &str,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let lease = self.conversation_lock(conversation_id);
        let _turn = lease.lock.lock().await;

        let mut state = load_or_new(self.store.as_ref(), conversation_id).await?;
        let pruned = state.prune_expired(Utc::now());
        if pruned > 0 {
            debug!(
                event_name = "agent.cache.pruned",
                conversation_id = %conversation_id,
                entries = pruned,
                "expired cached results pruned"
            );
        }

        let (mut pending, resumed) = match state.pending_turn.take() {
            Some(pending) if pending.matches(message) => {
                info!(
                    event_name = "agent.turn.resumed",
                    conversation_id = %conversation_id,
                    correlation_id = pending.correlation_id.as_str(),
                    stage = pending.stage.as_str(),
                    "resuming interrupted turn"
                );
                (pending, true)
            }
            stale => {
                if let Some(stale) = stale {
                    warn!(
                        event_name = "agent.turn.pending_discarded",
                        conversation_id = %conversation_id,
                        correlation_id = stale.correlation_id.as_str(),
                        stage = stale.stage.as_str(),
                        "interrupted turn superseded by a new message"
                    );
                }
                (self.extract(&mut state, message).await?, false)
            }
        };

        if pending.plan.is_none() {
            let plan = self.plan(&state, &pending).await;
            pending.plan = Some(plan);
            pending.stage = TurnStage::Planned;
            self.checkpoint(&mut state, &pending).await?;
        }
        let plan = pending.plan.clone().unwrap_or_default();

        if pending.stage < TurnStage::Executed {
            let report = self.executor.execute(&plan, &state).await;
            if self.executor.settings().cache_enabled {
                let now = Utc::now();
                for (call, result) in plan.calls.iter().zip(&report.results) {
                    if let Some(spec) = self.registry().spec(&call.tool_name) {
                        state.cache_result(call.fingerprint(), result, spec.cache_ttl(), now);
                    }
                }
            }
            pending.results = report.results;
            pending.stage = TurnStage::Executed;
            self.checkpoint(&mut state, &pending).await?;
        }

        self.complete(state, pending, plan, resumed).await
    }

    async fn extract(
        &self,
        state: &mut ConversationState,
        message: &str,
    ) -> Result<PendingTurn, StoreError> {
        let correlation_id = Uuid::new_v4().to_string();
        info!(
            event_name = "agent.turn.started",
            conversation_id = %state.conversation_id,
            correlation_id = correlation_id.as_str(),
            turn_index = state.turn_index,
            "turn started"
        );

        let outcome = self.extractor.extract(message, state).await;
        if outcome.failed {
            warn!(
                event_name = "agent.extract.failed",
                conversation_id = %state.conversation_id,
                correlation_id = correlation_id.as_str(),
                "{}",
                OrchestrationError::ExtractionFailure
            );
        }
        let pending = PendingTurn {
            message: message.to_string(),
            correlation_id,
            stage: TurnStage::Extracted,
            entities: outcome.entities,
            ambiguities: outcome.ambiguities,
            extraction_failed: outcome.failed,
            plan: None,
            results: Vec::new(),
        };
        self.checkpoint(state, &pending).await?;
        Ok(pending)
    }

    async fn plan(&self, state: &ConversationState, pending: &PendingTurn) -> Plan {
        let start = state.recent_turns.len().saturating_sub(self.recent_turns);
        self.planner
            .plan(&PlanRequest {
                message: &pending.message,
                entities: &pending.entities,
                ambiguities: &pending.ambiguities,
                recent_turns: &state.recent_turns[start..],
                extraction_failed: pending.extraction_failed,
            })
            .await
    }

    async fn complete(
        &self,
        mut state: ConversationState,
        pending: PendingTurn,
        plan: Plan,
        resumed: bool,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let synthesis = self
            .synthesizer
            .synthesize(&SynthesisInput {
                message: &pending.message,
                plan: &plan,
                results: &pending.results,
                entities: &pending.entities,
                ambiguities: &pending.ambiguities,
            })
            .await;

        let any_tool_failed = pending.results.iter().any(|result| !result.is_ok());
        let any_tool_succeeded = pending.results.iter().any(ToolResult::is_ok);
        let sentiment = pending.entities.sentiment();

        let mut sentiment_trend = state.sentiment_trend.clone();
        sentiment_trend.extend(sentiment);
        let consecutive_tool_failures = if any_tool_failed {
            state.consecutive_tool_failures + 1
        } else if any_tool_succeeded {
            0
        } else {
            state.consecutive_tool_failures
        };
        let decision = self.escalation.evaluate(&EscalationSignals {
            message: &pending.message,
            sentiment_trend: &sentiment_trend,
            confidence: synthesis.confidence,
            clarifications_used: state.clarifications_used
                + u32::from(synthesis.requires_clarification),
            consecutive_tool_failures,
            turn_index: state.turn_index,
        });

        let mut recovered = Vec::new();
        if pending.extraction_failed {
            recovered.push(OrchestrationError::ExtractionFailure);
        }
        recovered.extend(plan.rejections.iter().cloned().map(OrchestrationError::PlanValidation));
        recovered.extend(
            pending
                .results
                .iter()
                .filter_map(|result| result.error_detail.clone())
                .map(OrchestrationError::Tool),
        );
        recovered.extend(synthesis.failure);

        let mut reply = synthesis.reply;
        if let EscalationDecision::Escalate { user_message, .. } = &decision {
            reply.push_str("\n\n");
            reply.push_str(user_message);
        }

        state.complete_turn(CompletedTurn {
            message: pending.message.clone(),
            reply: reply.clone(),
            entities: pending.entities.clone(),
            sentiment,
            tools: plan.calls.iter().map(|call| call.tool_name.clone()).collect(),
            requires_clarification: synthesis.requires_clarification,
            any_tool_failed,
            any_tool_succeeded,
            escalation_reason: decision.reason_code().map(str::to_string),
        });
        state.checkpoint_version = self.store.checkpoint(&state, TurnStage::Completed).await?;

        info!(
            event_name = "agent.turn.completed",
            conversation_id = %state.conversation_id,
            correlation_id = pending.correlation_id.as_str(),
            calls = plan.calls.len(),
            failed_calls = pending.results.iter().filter(|result| !result.is_ok()).count(),
            confidence = synthesis.confidence,
            escalate = state.escalation_flag,
            "turn completed"
        );

        Ok(TurnOutcome {
            conversation_id: state.conversation_id.clone(),
            correlation_id: pending.correlation_id,
            reply,
            confidence: synthesis.confidence,
            requires_clarification: synthesis.requires_clarification,
            escalate: decision.is_escalation() || state.escalation_flag,
            escalation_reason: state.escalation_reason.clone(),
            resumed,
            plan,
            results: pending.results,
            recovered,
            state,
        })
    }

    async fn checkpoint(
        &self,
        state: &mut ConversationState,
        pending: &PendingTurn,
    ) -> Result<(), StoreError> {
        state.pending_turn = Some(pending.clone());
        let version = self.store.checkpoint(state, pending.stage).await?;
        state.checkpoint_version = version;
        debug!(
            event_name = "agent.turn.checkpointed",
            conversation_id = %state.conversation_id,
            correlation_id = pending.correlation_id.as_str(),
            stage = pending.stage.as_str(),
            version,
            "turn checkpointed"
        );
        Ok(())
    }
}
