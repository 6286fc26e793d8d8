//! Turn planning
//!
//! One structured completion turns the message, the merged entities and the
//! tool catalogue into a [`Plan`]. The answer is validated against the
//! registry; a rejected or unparseable answer gets exactly one stricter
//! retry before the turn falls back to asking for clarification.

use std::sync::Arc;
use std::time::Duration;

use clerk_core::domain::conversation::TurnSummary;
use clerk_core::domain::entity::{Ambiguity, EntityLabel, EntitySet};
use clerk_core::domain::plan::{Plan, PlanOrigin};
use clerk_core::domain::tool::{ConcurrencyGroup, ToolArguments, ToolCall};
use clerk_core::errors::PlanValidationError;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::llm::{CompletionRequest, LlmClient, ProviderError, Purpose};
use crate::tools::{ShopTool, ToolRegistry};

const PLANNER_SYSTEM_PROMPT: &str = "You plan tool calls for an online shop assistant. \
Use only the listed tools and their exact argument names. Prices are whole-dollar integers \
without currency symbols. Prefer the most specific tool: an order number means \
get_order_status, not a product search. Use depends_on (indexes of earlier calls) only when a \
call needs another call's output. If the request is too vague to act on, return no calls, set \
requires_clarification and ask one short clarification_question.";

const GENERIC_CLARIFICATION: &str = "Could you tell me a bit more about what you're looking \
for? For example a product, an order number or a store policy.";

/// Everything the planner sees for one turn.
#[derive(Clone, Copy, Debug)]
pub struct PlanRequest<'a> {
    pub message: &'a str,
    pub entities: &'a EntitySet,
    pub ambiguities: &'a [Ambiguity],
    pub recent_turns: &'a [TurnSummary],
    pub extraction_failed: bool,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    calls: Vec<RawCall>,
    #[serde(default)]
    reasoning_summary: String,
    #[serde(default)]
    requires_clarification: bool,
    #[serde(default)]
    clarification_question: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCall {
    #[serde(alias = "tool_name", alias = "name")]
    tool: String,
    #[serde(default)]
    arguments: Map<String, Value>,
    #[serde(default)]
    depends_on: Vec<usize>,
}

enum Rejection {
    Provider(ProviderError),
    Invalid(PlanValidationError),
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    heuristic_fallback: bool,
    timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, heuristic_fallback: bool) -> Self {
        Self { llm, registry, heuristic_fallback, timeout: DEFAULT_TIMEOUT }
    }

    /// Bounds each planning completion; an elapsed call is treated as a
    /// transient provider failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn plan(&self, request: &PlanRequest<'_>) -> Plan {
        if request.extraction_failed {
            return Plan::clarification(
                "entity extraction failed for this message",
                Some(GENERIC_CLARIFICATION.to_string()),
            );
        }

        let first_error = match self.attempt(request, None).await {
            Ok(plan) => return plan,
            Err(Rejection::Provider(error)) => return self.provider_fallback(request, error),
            Err(Rejection::Invalid(error)) => error,
        };
        warn!(
            event_name = "agent.plan.validation_failed",
            attempt = 1,
            error = %first_error,
            "plan rejected; retrying with a stricter reminder"
        );

        let mut plan = match self.attempt(request, Some(&first_error)).await {
            Ok(mut plan) => {
                plan.origin = PlanOrigin::ModelRetry;
                plan
            }
            Err(Rejection::Provider(error)) => self.provider_fallback(request, error),
            Err(Rejection::Invalid(error)) => {
                warn!(
                    event_name = "agent.plan.validation_failed",
                    attempt = 2,
                    error = %error,
                    "plan rejected twice; asking for clarification"
                );
                let mut plan = Plan::clarification(
                    format!("no valid plan after retry: {error}"),
                    Some(clarifying_question(request.entities, request.ambiguities)),
                );
                plan.rejections.push(error);
                plan
            }
        };
        plan.rejections.insert(0, first_error);
        plan
    }

    async fn attempt(
        &self,
        request: &PlanRequest<'_>,
        previous_error: Option<&PlanValidationError>,
    ) -> Result<Plan, Rejection> {
        let mut prompt = self.render_prompt(request);
        if let Some(error) = previous_error {
            prompt.push_str(&format!(
                "\n\nYour previous answer was rejected: {error}. Answer with a single JSON \
                 object exactly matching the schema. Use only the listed tool names and \
                 argument keys, with integer prices."
            ));
        }

        let call = self.llm.complete(CompletionRequest {
            purpose: Purpose::Planning,
            system: PLANNER_SYSTEM_PROMPT.to_string(),
            prompt,
            schema: Some(plan_schema()),
        });
        let completion = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                Rejection::Provider(ProviderError::transient(format!(
                    "planning completion timed out after {} ms",
                    self.timeout.as_millis()
                )))
            })?
            .map_err(Rejection::Provider)?;

        let value = completion
            .into_structured()
            .map_err(|reason| Rejection::Invalid(PlanValidationError::Malformed(reason)))?;
        let raw: RawPlan = serde_json::from_value(value).map_err(|error| {
            Rejection::Invalid(PlanValidationError::Malformed(error.to_string()))
        })?;

        let plan = self.accept(raw).map_err(Rejection::Invalid)?;
        Ok(prefer_specific(plan, request.entities, &self.registry))
    }

    fn accept(&self, raw: RawPlan) -> Result<Plan, PlanValidationError> {
        let calls = raw
            .calls
            .into_iter()
            .map(|call| ToolCall {
                tool_name: call.tool,
                arguments: call.arguments.into_iter().collect(),
                concurrency_group: ConcurrencyGroup::Parallel,
                depends_on: call.depends_on,
            })
            .collect();
        let calls = validate_calls(&self.registry, calls)?;

        if raw.requires_clarification {
            let question = raw
                .clarification_question
                .filter(|question| !question.trim().is_empty())
                .unwrap_or_else(|| GENERIC_CLARIFICATION.to_string());
            return Ok(Plan {
                origin: PlanOrigin::Model,
                ..Plan::clarification(raw.reasoning_summary, Some(question))
            });
        }

        Ok(Plan {
            calls,
            reasoning_summary: raw.reasoning_summary,
            requires_clarification: false,
            clarification_question: None,
            origin: PlanOrigin::Model,
            rejections: Vec::new(),
        })
    }

    fn provider_fallback(&self, request: &PlanRequest<'_>, error: ProviderError) -> Plan {
        warn!(
            event_name = "agent.plan.provider_failed",
            transient = error.transient,
            error = %error,
            heuristic = self.heuristic_fallback,
            "planning completion unavailable"
        );
        if self.heuristic_fallback {
            return heuristic_plan(&self.registry, request);
        }
        Plan::clarification(
            format!("planner unavailable: {}", error.message),
            Some(clarifying_question(request.entities, request.ambiguities)),
        )
    }

    fn render_prompt(&self, request: &PlanRequest<'_>) -> String {
        let tools = serde_json::to_string_pretty(&self.registry.schema_json())
            .unwrap_or_else(|_| self.registry.schema_json().to_string());

        let mut prompt = format!("Tools:\n{tools}\n\nEntities:\n");
        let mut any = false;
        for entity in request.entities.factual() {
            any = true;
            let carried = if entity.carried_over { ", from an earlier turn" } else { "" };
            prompt.push_str(&format!(
                "- {} = {} (confidence {:.2}{carried})\n",
                entity.label, entity.normalized_value, entity.confidence
            ));
        }
        if !any {
            prompt.push_str("- none\n");
        }
        if !request.ambiguities.is_empty() {
            prompt.push_str("\nUnclear phrases:\n");
            for ambiguity in request.ambiguities {
                prompt.push_str(&format!("- {}: \"{}\"\n", ambiguity.label, ambiguity.raw_text));
            }
        }
        if !request.recent_turns.is_empty() {
            prompt.push_str("\nRecent turns:\n");
            for turn in request.recent_turns {
                prompt.push_str(&format!(
                    "Customer: {}\nAssistant: {}\n",
                    turn.user_message, turn.reply
                ));
            }
        }
        prompt.push_str(&format!("\nMessage: {}", request.message));
        prompt
    }
}

fn plan_schema() -> Value {
    json!({
        "type": "object",
        "required": ["calls", "reasoning_summary", "requires_clarification"],
        "properties": {
            "calls": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["tool", "arguments"],
                    "properties": {
                        "tool": {"type": "string"},
                        "arguments": {"type": "object"},
                        "depends_on": {"type": "array", "items": {"type": "integer", "minimum": 0}},
                    },
                },
            },
            "reasoning_summary": {"type": "string"},
            "requires_clarification": {"type": "boolean"},
            "clarification_question": {"type": "string"},
        },
    })
}

/// Validates every call against the registry and checks that dependencies
/// point at earlier calls. Returns the calls with normalized arguments.
pub fn validate_calls(
    registry: &ToolRegistry,
    calls: Vec<ToolCall>,
) -> Result<Vec<ToolCall>, PlanValidationError> {
    calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            if let Some(&dependency) = call.depends_on.iter().find(|dependency| **dependency >= index) {
                return Err(PlanValidationError::InvalidDependency { index, dependency });
            }
            registry.validate_call(call)
        })
        .collect()
}

/// An order number in this message routes to order lookup instead of a
/// product search.
fn prefer_specific(plan: Plan, entities: &EntitySet, registry: &ToolRegistry) -> Plan {
    let order_id = match entities.get(EntityLabel::OrderId) {
        Some(entity) if !entity.carried_over => entity.normalized_value.to_string(),
        _ => return plan,
    };
    let names: Vec<&str> = plan.calls.iter().map(|call| call.tool_name.as_str()).collect();
    if names.contains(&ShopTool::GetOrderStatus.name())
        || !names.contains(&ShopTool::SearchProducts.name())
    {
        return plan;
    }

    let mut order_call = ToolArguments::new();
    order_call.insert("order_id".to_string(), Value::String(order_id.clone()));
    let Ok(order_call) = registry.validate_call(&ToolCall::new(
        ShopTool::GetOrderStatus.name(),
        order_call,
        ConcurrencyGroup::Parallel,
    )) else {
        return plan;
    };

    let mut remap: Vec<Option<usize>> = Vec::with_capacity(plan.calls.len());
    let mut calls: Vec<ToolCall> = Vec::new();
    let mut replaced = false;
    for call in plan.calls.into_iter() {
        let depends_on_removed = call.depends_on.iter().any(|dependency| remap[*dependency].is_none());
        if call.tool_name == ShopTool::SearchProducts.name() {
            if replaced {
                remap.push(None);
                continue;
            }
            replaced = true;
            remap.push(Some(calls.len()));
            calls.push(order_call.clone());
            continue;
        }
        if depends_on_removed {
            remap.push(None);
            continue;
        }
        let depends_on =
            call.depends_on.iter().filter_map(|dependency| remap[*dependency]).collect();
        remap.push(Some(calls.len()));
        calls.push(ToolCall { depends_on, ..call });
    }

    info!(
        event_name = "agent.plan.tie_break",
        order_id = order_id.as_str(),
        "order number present; routed search to order lookup"
    );
    Plan { calls, ..plan }
}

const POLICY_KEYWORDS: &[(&str, &[&str])] = &[
    ("refund", &["refund", "return", "exchange", "money back"]),
    ("shipping", &["shipping policy", "free shipping", "delivery time", "how long does shipping"]),
    ("privacy", &["privacy", "personal data", "personal information"]),
    ("terms", &["terms", "conditions"]),
    ("subscription", &["subscription"]),
];
const CONTACT_KEYWORDS: &[&str] = &["contact", "phone", "email you", "call you", "customer service"];
const STORE_KEYWORDS: &[&str] = &["hours", "open", "opening", "address", "located", "location"];

/// Deterministic plan built from entities and keywords when the planning
/// completion is unavailable.
pub fn heuristic_plan(registry: &ToolRegistry, request: &PlanRequest<'_>) -> Plan {
    let entities = request.entities;
    let lowered = request.message.to_lowercase();
    let mut calls: Vec<ToolCall> = Vec::new();
    let mut add = |tool: ShopTool, arguments: ToolArguments| {
        let call = ToolCall::new(tool.name(), arguments, ConcurrencyGroup::Parallel);
        if let Ok(call) = registry.validate_call(&call) {
            calls.push(call);
        }
    };

    let price_unclear = request.ambiguities.iter().any(|item| item.label.is_price_bound())
        && !entities.contains(EntityLabel::PriceMin)
        && !entities.contains(EntityLabel::PriceMax);

    if let Some(order_id) = entities.text(EntityLabel::OrderId) {
        add(ShopTool::GetOrderStatus, arguments(&[("order_id", json!(order_id))]));
    } else {
        if let Some(query) = search_query(entities) {
            if !price_unclear {
                add(ShopTool::SearchProducts, search_arguments(entities, query));
            }
        }
        if let Some((policy_type, _)) = POLICY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|keyword| lowered.contains(keyword)))
        {
            add(ShopTool::GetPolicy, arguments(&[("policy_type", json!(policy_type))]));
        }
    }
    if CONTACT_KEYWORDS.iter().any(|keyword| lowered.contains(keyword)) {
        add(ShopTool::GetContactInfo, ToolArguments::new());
    }
    if STORE_KEYWORDS.iter().any(|keyword| lowered.contains(keyword)) {
        add(ShopTool::GetStoreInfo, ToolArguments::new());
    }

    if calls.is_empty() {
        return Plan {
            origin: PlanOrigin::Heuristic,
            ..Plan::clarification(
                "no tool matched the message",
                Some(clarifying_question(entities, request.ambiguities)),
            )
        };
    }

    let tools: Vec<&str> = calls.iter().map(|call| call.tool_name.as_str()).collect();
    let reasoning_summary = format!("heuristic plan from extracted entities: {}", tools.join(", "));
    Plan {
        calls,
        reasoning_summary,
        requires_clarification: false,
        clarification_question: None,
        origin: PlanOrigin::Heuristic,
        rejections: Vec::new(),
    }
}

fn arguments(pairs: &[(&str, Value)]) -> ToolArguments {
    pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
}

fn search_query(entities: &EntitySet) -> Option<String> {
    entities
        .text(EntityLabel::ProductTerm)
        .or_else(|| entities.text(EntityLabel::Category))
        .map(str::to_string)
        .or_else(|| entities.text(EntityLabel::Brand).map(str::to_lowercase))
}

fn search_arguments(entities: &EntitySet, query: String) -> ToolArguments {
    let mut arguments = ToolArguments::new();
    for (label, key) in [
        (EntityLabel::Brand, "brand"),
        (EntityLabel::Color, "color"),
        (EntityLabel::Size, "size"),
    ] {
        if let Some(value) = entities.text(label) {
            arguments.insert(key.to_string(), json!(value));
        }
    }
    if let Some(category) = entities.text(EntityLabel::Category) {
        if category != query {
            arguments.insert("category".to_string(), json!(category));
        }
    }
    if let Some(cents) = entities.cents(EntityLabel::PriceMin) {
        arguments.insert("price_min".to_string(), json!((cents + 99) / 100));
    }
    if let Some(cents) = entities.cents(EntityLabel::PriceMax) {
        arguments.insert("price_max".to_string(), json!(cents / 100));
    }
    arguments.insert("query".to_string(), json!(query));
    arguments
}

/// Question that names what is unclear, when something specific is.
pub fn clarifying_question(entities: &EntitySet, ambiguities: &[Ambiguity]) -> String {
    if let Some(ambiguity) = ambiguities.iter().find(|item| item.label.is_price_bound()) {
        return format!(
            "When you said \"{}\", what price in dollars did you have in mind?",
            ambiguity.raw_text
        );
    }
    if let Some(ambiguity) = ambiguities.first() {
        return format!("Could you tell me more about \"{}\"?", ambiguity.raw_text);
    }
    let has_price = entities.contains(EntityLabel::PriceMin) || entities.contains(EntityLabel::PriceMax);
    if has_price && search_query(entities).is_none() {
        return "What kind of product are you looking for in that price range?".to_string();
    }
    GENERIC_CLARIFICATION.to_string()
}
