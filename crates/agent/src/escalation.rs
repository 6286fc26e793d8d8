//! Escalation gate
//!
//! Decides after each turn whether the conversation should go to a human.
//! Rules are checked in a fixed order and the first match wins, so the
//! reason code names the most direct cause.

use clerk_core::config::EscalationConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

/// Requests for a person. `agent` and `person` only count inside a phrase,
/// so product talk such as "a one person tent" stays with the assistant.
static EXPLICIT_REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)\b(?:
            (?:talk|speak|chat)\s+(?:to|with)\s+(?:a\s+|an\s+|the\s+|your\s+)?(?:real\s+|live\s+)?
                (?:human|agent|person|someone|somebody|representative|rep|manager|supervisor)
            | (?:real|actual)\s+(?:person|human)
            | live\s+(?:agent|person)
            | human\s+(?:agent|being|support)
            | (?:want|need|get)\s+(?:me\s+)?(?:a|an|the|your)\s+(?:human|agent|representative|manager|supervisor)
            | (?:customer\s+service\s+)?representative
            | escalate
            | (?:file|make|lodge)\s+a\s+complaint
        )\b",
    )
    .expect("valid explicit request regex")
});

const HANDOFF_MESSAGE: &str =
    "I'm connecting you with a member of our support team who can take it from here.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscalationRule {
    ExplicitRequest,
    NegativeSentimentStreak,
    LowConfidenceRepeatedClarification,
    RepeatedToolFailures,
    TurnLimit,
}

impl EscalationRule {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ExplicitRequest => "explicit_request",
            Self::NegativeSentimentStreak => "negative_sentiment_streak",
            Self::LowConfidenceRepeatedClarification => "low_confidence_repeated_clarification",
            Self::RepeatedToolFailures => "repeated_tool_failures",
            Self::TurnLimit => "turn_limit",
        }
    }
}

/// Signals for the turn being closed.
#[derive(Clone, Copy, Debug)]
pub struct EscalationSignals<'a> {
    pub message: &'a str,
    /// Sentiment scores oldest first, including this turn's.
    pub sentiment_trend: &'a [f64],
    pub confidence: f64,
    /// Clarification replies so far, including this turn's.
    pub clarifications_used: u32,
    /// Failing turns in a row, including this one.
    pub consecutive_tool_failures: u32,
    /// Zero-based index of this turn.
    pub turn_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationDecision {
    Continue,
    Escalate { rule: EscalationRule, user_message: String },
}

impl EscalationDecision {
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Escalate { .. })
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            Self::Continue => None,
            Self::Escalate { rule, .. } => Some(rule.reason_code()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EscalationPolicy {
    pub negative_sentiment_threshold: f64,
    pub negative_streak: u32,
    pub low_confidence_threshold: f64,
    pub max_clarifications: u32,
    pub max_consecutive_tool_failures: Option<u32>,
    pub max_turns: Option<u32>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            negative_sentiment_threshold: -0.3,
            negative_streak: 3,
            low_confidence_threshold: 0.4,
            max_clarifications: 2,
            max_consecutive_tool_failures: None,
            max_turns: None,
        }
    }
}

impl From<&EscalationConfig> for EscalationPolicy {
    fn from(config: &EscalationConfig) -> Self {
        Self {
            negative_sentiment_threshold: config.negative_sentiment_threshold,
            negative_streak: config.negative_streak,
            low_confidence_threshold: config.low_confidence_threshold,
            max_clarifications: config.max_clarifications,
            max_consecutive_tool_failures: config.max_consecutive_tool_failures,
            max_turns: config.max_turns,
        }
    }
}

impl EscalationPolicy {
    pub fn evaluate(&self, signals: &EscalationSignals<'_>) -> EscalationDecision {
        let Some(rule) = self.matching_rule(signals) else {
            return EscalationDecision::Continue;
        };

        info!(
            event_name = "agent.escalation.triggered",
            reason_code = rule.reason_code(),
            turn_index = signals.turn_index,
            confidence = signals.confidence,
            "conversation escalated to a human"
        );
        EscalationDecision::Escalate { rule, user_message: HANDOFF_MESSAGE.to_string() }
    }

    fn matching_rule(&self, signals: &EscalationSignals<'_>) -> Option<EscalationRule> {
        if EXPLICIT_REQUEST.is_match(signals.message) {
            return Some(EscalationRule::ExplicitRequest);
        }
        if self.negative_streak_reached(signals.sentiment_trend) {
            return Some(EscalationRule::NegativeSentimentStreak);
        }
        if signals.confidence < self.low_confidence_threshold
            && signals.clarifications_used >= self.max_clarifications
        {
            return Some(EscalationRule::LowConfidenceRepeatedClarification);
        }
        if self
            .max_consecutive_tool_failures
            .is_some_and(|limit| signals.consecutive_tool_failures >= limit)
        {
            return Some(EscalationRule::RepeatedToolFailures);
        }
        if self.max_turns.is_some_and(|limit| signals.turn_index + 1 >= limit) {
            return Some(EscalationRule::TurnLimit);
        }
        None
    }

    fn negative_streak_reached(&self, trend: &[f64]) -> bool {
        let streak = self.negative_streak as usize;
        if streak == 0 || trend.len() < streak {
            return false;
        }
        trend[trend.len() - streak..]
            .iter()
            .all(|score| *score < self.negative_sentiment_threshold)
    }
}
