//! Per-call execution lifecycle
//!
//! Deterministic state machine for a single planned tool call plus the retry
//! policy the executor applies uniformly to every call. Transitions are
//! validated and recorded so a call's history can be audited after the turn.
//!
//! ```text
//! PLANNED -> RUNNING -> {SUCCEEDED, FAILED, TIMED_OUT} -> (RETRY -> RUNNING)* -> TERMINAL
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tool::ToolErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Planned,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Retry,
    Terminal,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Retry => "retry",
            Self::Terminal => "terminal",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallTransitionError {
    #[error("invalid call transition from {from:?} to {to:?}")]
    InvalidTransition { from: CallState, to: CallState },
    #[error("attempt budget exhausted after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTransition {
    pub from: CallState,
    pub to: CallState,
    pub attempt: u32,
    pub reason: String,
}

/// Lifecycle of one planned call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLifecycle {
    state: CallState,
    attempts: u32,
    /// State the call was in right before `Terminal`.
    outcome: Option<CallState>,
    transitions: Vec<CallTransition>,
}

impl Default for CallLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CallLifecycle {
    pub fn new() -> Self {
        Self { state: CallState::Planned, attempts: 0, outcome: None, transitions: Vec::new() }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn outcome(&self) -> Option<CallState> {
        self.outcome
    }

    pub fn transitions(&self) -> &[CallTransition] {
        &self.transitions
    }

    /// PLANNED|RETRY -> RUNNING, counting a new attempt.
    pub fn start(&mut self) -> Result<u32, CallTransitionError> {
        self.apply(CallState::Running, "attempt_started")?;
        self.attempts += 1;
        if let Some(last) = self.transitions.last_mut() {
            last.attempt = self.attempts;
        }
        Ok(self.attempts)
    }

    pub fn succeed(&mut self) -> Result<(), CallTransitionError> {
        self.apply(CallState::Succeeded, "attempt_succeeded")
    }

    pub fn fail(&mut self, kind: ToolErrorKind) -> Result<(), CallTransitionError> {
        self.apply(CallState::Failed, kind.as_str())
    }

    pub fn time_out(&mut self) -> Result<(), CallTransitionError> {
        self.apply(CallState::TimedOut, "attempt_timed_out")
    }

    pub fn retry(&mut self, max_attempts: u32) -> Result<(), CallTransitionError> {
        if self.attempts >= max_attempts {
            return Err(CallTransitionError::AttemptsExhausted { attempts: self.attempts });
        }
        self.apply(CallState::Retry, "retry_scheduled")
    }

    pub fn finish(&mut self) -> Result<(), CallTransitionError> {
        let outcome = self.state;
        self.apply(CallState::Terminal, "call_finished")?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Resolves a call without running it: a cache replay settles as
    /// `Succeeded`, a call behind a failed dependency as `Failed`.
    pub fn settle(&mut self, reason: &str, outcome: CallState) -> Result<(), CallTransitionError> {
        if self.state != CallState::Planned {
            return Err(CallTransitionError::InvalidTransition {
                from: self.state,
                to: CallState::Terminal,
            });
        }
        self.transitions.push(CallTransition {
            from: CallState::Planned,
            to: CallState::Terminal,
            attempt: 0,
            reason: reason.to_string(),
        });
        self.state = CallState::Terminal;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Ends a call cancelled at the turn deadline.
    pub fn abandon(&mut self, reason: &str) {
        if self.state == CallState::Terminal {
            return;
        }
        let from = self.state;
        let outcome = match from {
            CallState::Succeeded | CallState::Failed | CallState::TimedOut => from,
            _ => CallState::TimedOut,
        };
        self.transitions.push(CallTransition {
            from,
            to: CallState::Terminal,
            attempt: self.attempts,
            reason: reason.to_string(),
        });
        self.state = CallState::Terminal;
        self.outcome = Some(outcome);
    }

    fn apply(&mut self, to: CallState, reason: &str) -> Result<(), CallTransitionError> {
        validate_transition(self.state, to)?;
        self.transitions.push(CallTransition {
            from: self.state,
            to,
            attempt: self.attempts,
            reason: reason.to_string(),
        });
        self.state = to;
        Ok(())
    }
}

fn validate_transition(from: CallState, to: CallState) -> Result<(), CallTransitionError> {
    let valid = matches!(
        (from, to),
        (CallState::Planned, CallState::Running)
            | (CallState::Retry, CallState::Running)
            | (CallState::Running, CallState::Succeeded)
            | (CallState::Running, CallState::Failed)
            | (CallState::Running, CallState::TimedOut)
            | (CallState::Failed, CallState::Retry)
            | (CallState::TimedOut, CallState::Retry)
            | (CallState::Succeeded, CallState::Terminal)
            | (CallState::Failed, CallState::Terminal)
            | (CallState::TimedOut, CallState::Terminal)
    );

    if valid {
        Ok(())
    } else {
        Err(CallTransitionError::InvalidTransition { from, to })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Retry schedule keyed by error class. Transient classes back off
/// exponentially with jitter; everything else surfaces immediately.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Fraction of the computed delay added as random jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// `attempt` is the number of attempts already made (1-based).
    pub fn decide(
        &self,
        kind: ToolErrorKind,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !kind.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.backoff(attempt);
        if kind == ToolErrorKind::RateLimited {
            if let Some(hint) = retry_after {
                delay = delay.max(hint);
            }
        }
        RetryDecision::Retry { delay }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        let base = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter_ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter_ceiling = base.as_secs_f64() * self.jitter_ratio.min(1.0);
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_ceiling);
        (base + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }
}
