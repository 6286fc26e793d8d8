use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entity::{Ambiguity, EntitySet};
use crate::domain::plan::Plan;
use crate::domain::tool::{Fingerprint, ToolResult};

/// How many recent exchanges are kept for planner context.
pub const MAX_RECENT_TURNS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Extracted,
    Planned,
    Executed,
    Completed,
}

impl TurnStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracted => "extracted",
            Self::Planned => "planned",
            Self::Executed => "executed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "extracted" => Some(Self::Extracted),
            "planned" => Some(Self::Planned),
            "executed" => Some(Self::Executed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Work finished so far for the turn in progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingTurn {
    pub message: String,
    pub correlation_id: String,
    pub stage: TurnStage,
    pub entities: EntitySet,
    #[serde(default)]
    pub ambiguities: Vec<Ambiguity>,
    #[serde(default)]
    pub extraction_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub results: Vec<ToolResult>,
}

impl PendingTurn {
    pub fn matches(&self, message: &str) -> bool {
        self.message.trim() == message.trim()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub result: ToolResult,
    pub expires_at: DateTime<Utc>,
}

impl CachedResult {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn_index: u32,
    pub user_message: String,
    pub reply: String,
    pub tools: Vec<String>,
}

/// Everything the orchestration core remembers about one conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: ConversationId,
    pub turn_index: u32,
    pub entity_history: Vec<EntitySet>,
    pub tool_result_cache: BTreeMap<Fingerprint, CachedResult>,
    pub sentiment_trend: Vec<f64>,
    pub escalation_flag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    pub checkpoint_version: u64,
    #[serde(default)]
    pub clarifications_used: u32,
    #[serde(default)]
    pub consecutive_tool_failures: u32,
    #[serde(default)]
    pub recent_turns: Vec<TurnSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_turn: Option<PendingTurn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            turn_index: 0,
            entity_history: Vec::new(),
            tool_result_cache: BTreeMap::new(),
            sentiment_trend: Vec::new(),
            escalation_flag: false,
            escalation_reason: None,
            checkpoint_version: 0,
            clarifications_used: 0,
            consecutive_tool_failures: 0,
            recent_turns: Vec::new(),
            pending_turn: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_entities(&self) -> Option<&EntitySet> {
        self.entity_history.last()
    }

    pub fn cached_result(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<&ToolResult> {
        self.tool_result_cache
            .get(fingerprint)
            .filter(|entry| entry.is_live(now))
            .map(|entry| &entry.result)
    }

    /// Only successful results are worth replaying.
    pub fn cache_result(
        &mut self,
        fingerprint: Fingerprint,
        result: &ToolResult,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        if !result.is_ok() || result.from_cache || ttl <= Duration::zero() {
            return;
        }
        let mut stored = result.clone();
        stored.from_cache = false;
        self.tool_result_cache.insert(fingerprint, CachedResult { result: stored, expires_at: now + ttl });
    }

    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tool_result_cache.len();
        self.tool_result_cache.retain(|_, entry| entry.is_live(now));
        before - self.tool_result_cache.len()
    }

    /// The last `count` sentiment scores, oldest first.
    pub fn recent_sentiment(&self, count: usize) -> &[f64] {
        let start = self.sentiment_trend.len().saturating_sub(count);
        &self.sentiment_trend[start..]
    }

    /// Closes the pending turn and appends its outcome to the history.
    pub fn complete_turn(&mut self, outcome: CompletedTurn) {
        self.entity_history.push(outcome.entities);
        if let Some(sentiment) = outcome.sentiment {
            self.sentiment_trend.push(sentiment);
        }
        if outcome.requires_clarification {
            self.clarifications_used += 1;
        }
        if outcome.any_tool_failed {
            self.consecutive_tool_failures += 1;
        } else if outcome.any_tool_succeeded {
            self.consecutive_tool_failures = 0;
        }
        if let Some(reason) = outcome.escalation_reason {
            self.escalation_flag = true;
            self.escalation_reason = Some(reason);
        }

        self.recent_turns.push(TurnSummary {
            turn_index: self.turn_index,
            user_message: outcome.message,
            reply: outcome.reply,
            tools: outcome.tools,
        });
        if self.recent_turns.len() > MAX_RECENT_TURNS {
            let excess = self.recent_turns.len() - MAX_RECENT_TURNS;
            self.recent_turns.drain(..excess);
        }

        self.turn_index += 1;
        self.pending_turn = None;
        self.updated_at = Utc::now();
    }
}

/// Outcome of a finished turn, folded into the state by `complete_turn`.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedTurn {
    pub message: String,
    pub reply: String,
    pub entities: EntitySet,
    pub sentiment: Option<f64>,
    pub tools: Vec<String>,
    pub requires_clarification: bool,
    pub any_tool_failed: bool,
    pub any_tool_succeeded: bool,
    pub escalation_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{CompletedTurn, ConversationId, ConversationState, MAX_RECENT_TURNS};
    use crate::domain::entity::EntitySet;
    use crate::domain::tool::{Fingerprint, ToolArguments, ToolError, ToolResult};

    fn completed(message: &str, sentiment: f64) -> CompletedTurn {
        CompletedTurn {
            message: message.to_string(),
            reply: "ok".to_string(),
            entities: EntitySet::new(),
            sentiment: Some(sentiment),
            tools: Vec::new(),
            requires_clarification: false,
            any_tool_failed: false,
            any_tool_succeeded: true,
            escalation_reason: None,
        }
    }

    #[test]
    fn cache_only_replays_live_successes() {
        let mut state = ConversationState::new(ConversationId::new("c-1"));
        let now = Utc::now();
        let fingerprint = Fingerprint::of("get_store_info", &ToolArguments::new());
        let ok = ToolResult::ok("get_store_info", json!({"name": "Clerk Store"}), 40, 1);

        state.cache_result(fingerprint.clone(), &ok, Duration::seconds(60), now);
        assert!(state.cached_result(&fingerprint, now + Duration::seconds(59)).is_some());
        assert!(state.cached_result(&fingerprint, now + Duration::seconds(60)).is_none());

        let failed_fp = Fingerprint::of("get_faq", &ToolArguments::new());
        let failed = ToolResult::failed("get_faq", ToolError::upstream("503"), 10, 3);
        state.cache_result(failed_fp.clone(), &failed, Duration::seconds(60), now);
        assert!(state.cached_result(&failed_fp, now).is_none());

        assert_eq!(state.prune_expired(now + Duration::seconds(120)), 1);
        assert!(state.tool_result_cache.is_empty());
    }

    #[test]
    fn complete_turn_tracks_history_and_counters() {
        let mut state = ConversationState::new(ConversationId::new("c-2"));

        let mut first = completed("hello", 0.2);
        first.requires_clarification = true;
        first.any_tool_failed = true;
        first.any_tool_succeeded = false;
        state.complete_turn(first);
        state.complete_turn(completed("sony headphones", -0.5));

        assert_eq!(state.turn_index, 2);
        assert_eq!(state.entity_history.len(), 2);
        assert_eq!(state.sentiment_trend, vec![0.2, -0.5]);
        assert_eq!(state.clarifications_used, 1);
        assert_eq!(state.consecutive_tool_failures, 0);
        assert_eq!(state.recent_sentiment(1), &[-0.5]);
    }

    #[test]
    fn recent_turns_are_bounded() {
        let mut state = ConversationState::new(ConversationId::new("c-3"));
        for turn in 0..(MAX_RECENT_TURNS + 3) {
            state.complete_turn(completed(&format!("message {turn}"), 0.0));
        }

        assert_eq!(state.recent_turns.len(), MAX_RECENT_TURNS);
        assert_eq!(state.recent_turns[0].user_message, "message 3");
        assert_eq!(state.entity_history.len(), MAX_RECENT_TURNS + 3);
    }

    #[test]
    fn escalation_flag_is_sticky() {
        let mut state = ConversationState::new(ConversationId::new("c-4"));
        let mut turn = completed("get me a manager", -0.1);
        turn.escalation_reason = Some("explicit_request".to_string());
        state.complete_turn(turn);
        state.complete_turn(completed("thanks", 0.5));

        assert!(state.escalation_flag);
        assert_eq!(state.escalation_reason.as_deref(), Some("explicit_request"));
    }
}
