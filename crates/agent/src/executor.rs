//! Plan execution
//!
//! Calls run level by level in dependency order. Within a level every
//! parallel call gets its own lane and each serial group shares one lane, so
//! calls in a group never overlap. Each call walks its [`CallLifecycle`]
//! through rate limiting, a per-call timeout and the retry policy; the whole
//! plan is bounded by the turn deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clerk_core::config::AppConfig;
use clerk_core::domain::conversation::ConversationState;
use clerk_core::domain::plan::Plan;
use clerk_core::domain::tool::{ToolCall, ToolError, ToolErrorKind, ToolResult};
use clerk_core::execution_engine::{
    CallLifecycle, CallState, CallTransitionError, RetryDecision, RetryPolicy,
};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::rate_limit::RateLimiter;
use crate::tools::{ShopTool, ToolRegistry};

/// Refill rate for tools the registry does not declare.
const DEFAULT_RATE_PER_MINUTE: u32 = 60;

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorSettings {
    pub call_timeout: Duration,
    pub turn_deadline: Duration,
    pub retry: RetryPolicy,
    pub cache_enabled: bool,
}

impl ExecutorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            call_timeout: config.executor.call_timeout(),
            turn_deadline: config.executor.turn_deadline(),
            retry: config.retry.policy(),
            cache_enabled: config.cache.enabled,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionReport {
    /// One result per planned call, in plan order.
    pub results: Vec<ToolResult>,
    pub lifecycles: Vec<CallLifecycle>,
    pub deadline_exceeded: bool,
}

impl ExecutionReport {
    pub fn any_failed(&self) -> bool {
        self.results.iter().any(|result| !result.is_ok())
    }

    pub fn any_succeeded(&self) -> bool {
        self.results.iter().any(ToolResult::is_ok)
    }
}

struct Slot {
    lifecycle: CallLifecycle,
    result: Option<ToolResult>,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    limiter: RateLimiter,
    cache: ResultCache,
    settings: ExecutorSettings,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        limiter: RateLimiter,
        cache: ResultCache,
        settings: ExecutorSettings,
    ) -> Self {
        Self { registry, limiter, cache, settings }
    }

    pub fn from_config(config: &AppConfig, registry: Arc<ToolRegistry>) -> Self {
        let longest_ttl = ShopTool::ALL
            .iter()
            .map(|tool| tool.spec().cache_ttl_secs)
            .max()
            .unwrap_or(3_600);
        Self::new(
            registry,
            RateLimiter::new(
                config.rate_limit.burst,
                Duration::from_millis(config.rate_limit.wait_ceiling_ms),
            ),
            ResultCache::new(config.cache.max_entries as u64, Duration::from_secs(longest_ttl)),
            ExecutorSettings::from_config(config),
        )
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Runs every call in the plan. Calls still running at the turn
    /// deadline are cancelled and reported as timeouts.
    pub async fn execute(&self, plan: &Plan, state: &ConversationState) -> ExecutionReport {
        if plan.calls.is_empty() {
            return ExecutionReport::default();
        }

        let turn_started = Instant::now();
        let slots = Mutex::new(
            plan.calls
                .iter()
                .map(|_| Slot { lifecycle: CallLifecycle::new(), result: None })
                .collect::<Vec<_>>(),
        );

        let run = async {
            for level in plan.execution_levels() {
                let lanes = lanes_for(plan, &level);
                join_all(lanes.into_iter().map(|lane| self.run_lane(plan, lane, state, &slots)))
                    .await;
            }
        };
        let deadline_exceeded =
            tokio::time::timeout(self.settings.turn_deadline, run).await.is_err();

        let elapsed_ms = turn_started.elapsed().as_millis() as u64;
        let mut results = Vec::with_capacity(plan.calls.len());
        let mut lifecycles = Vec::with_capacity(plan.calls.len());
        for (call, slot) in plan.calls.iter().zip(slots.into_inner()) {
            let Slot { mut lifecycle, result } = slot;
            let result = match result {
                Some(result) => result,
                None => {
                    lifecycle.abandon("turn_deadline_exceeded");
                    ToolResult::failed(
                        call.tool_name.clone(),
                        ToolError::timeout("turn deadline exceeded before the call finished"),
                        elapsed_ms,
                        lifecycle.attempts(),
                    )
                }
            };
            results.push(result);
            lifecycles.push(lifecycle);
        }

        if deadline_exceeded {
            warn!(
                event_name = "agent.executor.deadline_exceeded",
                deadline_ms = self.settings.turn_deadline.as_millis() as u64,
                calls = plan.calls.len(),
                "turn deadline exceeded; unfinished calls cancelled"
            );
        }

        ExecutionReport { results, lifecycles, deadline_exceeded }
    }

    async fn run_lane(
        &self,
        plan: &Plan,
        lane: Vec<usize>,
        state: &ConversationState,
        slots: &Mutex<Vec<Slot>>,
    ) {
        for index in lane {
            let result = self.run_call(plan, index, state, slots).await;
            slots.lock()[index].result = Some(result);
        }
    }

    async fn run_call(
        &self,
        plan: &Plan,
        index: usize,
        state: &ConversationState,
        slots: &Mutex<Vec<Slot>>,
    ) -> ToolResult {
        let call = &plan.calls[index];
        let step = |apply: fn(&mut CallLifecycle) -> Result<(), CallTransitionError>| {
            transition(slots, index, &call.tool_name, apply);
        };

        let failed_dependency = {
            let slots = slots.lock();
            call.depends_on
                .iter()
                .copied()
                .find(|dependency| {
                    !slots
                        .get(*dependency)
                        .and_then(|slot| slot.result.as_ref())
                        .is_some_and(ToolResult::is_ok)
                })
        };
        if let Some(dependency) = failed_dependency {
            step(|lifecycle| lifecycle.settle("dependency_failed", CallState::Failed));
            return ToolResult::failed(
                call.tool_name.clone(),
                ToolError::new(
                    ToolErrorKind::DependencyFailed,
                    format!("call {dependency} this call depends on did not succeed"),
                ),
                0,
                0,
            );
        }

        let fingerprint = call.fingerprint();
        if self.settings.cache_enabled {
            let now = Utc::now();
            let hit = match state.cached_result(&fingerprint, now) {
                Some(result) => Some(result.clone()),
                None => self.cache.get(&fingerprint, now).await,
            };
            if let Some(hit) = hit {
                debug!(
                    event_name = "agent.executor.cache_hit",
                    tool = call.tool_name.as_str(),
                    fingerprint = %fingerprint,
                    "replaying cached tool result"
                );
                step(|lifecycle| lifecycle.settle("cache_hit", CallState::Succeeded));
                return hit.replayed_from_cache();
            }
        }

        let spec = self.registry.spec(&call.tool_name);
        let per_minute = spec.map_or(DEFAULT_RATE_PER_MINUTE, |spec| spec.rate_limit_per_minute);
        let started = Instant::now();

        loop {
            step(|lifecycle| lifecycle.start().map(|_| ()));
            let attempt = slots.lock()[index].lifecycle.attempts();

            match self.attempt(call, per_minute).await {
                Ok(payload) => {
                    step(CallLifecycle::succeed);
                    step(CallLifecycle::finish);
                    let result = ToolResult::ok(
                        call.tool_name.clone(),
                        payload,
                        started.elapsed().as_millis() as u64,
                        attempt,
                    );
                    if let Some(spec) = spec {
                        self.cache.put(fingerprint.clone(), &result, spec.cache_ttl(), Utc::now()).await;
                    }
                    info!(
                        event_name = "agent.executor.call_completed",
                        tool = call.tool_name.as_str(),
                        attempts = attempt,
                        latency_ms = result.latency_ms,
                        "tool call succeeded"
                    );
                    return result;
                }
                Err(error) => {
                    let kind = error.kind;
                    if kind == ToolErrorKind::Timeout {
                        step(CallLifecycle::time_out);
                    } else {
                        transition(slots, index, &call.tool_name, |lifecycle| lifecycle.fail(kind));
                    }

                    let hint = error.retry_after_ms.map(Duration::from_millis);
                    match self.settings.retry.decide(kind, attempt, hint) {
                        RetryDecision::Retry { delay } => {
                            let max_attempts = self.settings.retry.max_attempts;
                            transition(slots, index, &call.tool_name, |lifecycle| {
                                lifecycle.retry(max_attempts)
                            });
                            warn!(
                                event_name = "agent.executor.call_retry",
                                tool = call.tool_name.as_str(),
                                attempt,
                                error_kind = kind.as_str(),
                                delay_ms = delay.as_millis() as u64,
                                "retrying tool call"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            step(CallLifecycle::finish);
                            warn!(
                                event_name = "agent.executor.call_failed",
                                tool = call.tool_name.as_str(),
                                attempts = attempt,
                                error_kind = kind.as_str(),
                                error = %error,
                                "tool call failed"
                            );
                            return ToolResult::failed(
                                call.tool_name.clone(),
                                error,
                                started.elapsed().as_millis() as u64,
                                attempt,
                            );
                        }
                    }
                }
            }
        }
    }

    async fn attempt(&self, call: &ToolCall, per_minute: u32) -> Result<serde_json::Value, ToolError> {
        self.limiter.acquire(&call.tool_name, per_minute).await?;
        match tokio::time::timeout(self.settings.call_timeout, self.registry.invoke(call)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolError::timeout(format!(
                "`{}` did not answer within {}ms",
                call.tool_name,
                self.settings.call_timeout.as_millis()
            ))),
        }
    }
}

fn transition(
    slots: &Mutex<Vec<Slot>>,
    index: usize,
    tool: &str,
    apply: impl FnOnce(&mut CallLifecycle) -> Result<(), CallTransitionError>,
) {
    if let Err(error) = apply(&mut slots.lock()[index].lifecycle) {
        warn!(
            event_name = "agent.executor.invalid_transition",
            tool,
            error = %error,
            "call lifecycle rejected a transition"
        );
    }
}

/// Splits one dependency level into lanes: a lane per parallel call and
/// one per serial group, each keeping plan order.
fn lanes_for(plan: &Plan, level: &[usize]) -> Vec<Vec<usize>> {
    let mut lanes: Vec<Vec<usize>> = Vec::new();
    let mut serial: HashMap<&str, usize> = HashMap::new();
    for &index in level {
        match plan.calls[index].concurrency_group.serial_key() {
            None => lanes.push(vec![index]),
            Some(group) => match serial.get(group) {
                Some(&lane) => lanes[lane].push(index),
                None => {
                    serial.insert(group, lanes.len());
                    lanes.push(vec![index]);
                }
            },
        }
    }
    lanes
}
