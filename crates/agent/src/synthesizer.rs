//! Reply synthesis
//!
//! Every failed call is acknowledged in the reply; nothing is narrated from
//! a call that did not succeed. Template mode renders replies without a
//! model. Model mode asks the model and then appends any acknowledgment the
//! model left out.

use std::sync::Arc;
use std::time::Duration;

use clerk_core::config::SynthesisMode;
use clerk_core::domain::entity::{Ambiguity, EntitySet};
use clerk_core::domain::plan::Plan;
use clerk_core::domain::tool::{ToolCall, ToolErrorKind, ToolResult};
use clerk_core::errors::OrchestrationError;
use serde_json::Value;
use tracing::warn;

use crate::llm::{CompletionRequest, LlmClient, Purpose};
use crate::planner::clarifying_question;
use crate::tools::ShopTool;

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a friendly assistant for an online shop. \
Answer the customer using only the tool results provided. Never invent products, prices, \
order details or policies. Keep the answer under 120 words.";

const APOLOGY: &str = "I'm sorry, I ran into a problem putting together an answer. \
Could you ask again in a moment?";

const GREETING: &str = "How can I help you today? I can search products, check an order \
or look up store policies.";

/// Most products listed in a templated search reply.
const MAX_LISTED_PRODUCTS: usize = 5;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
pub struct SynthesisInput<'a> {
    pub message: &'a str,
    pub plan: &'a Plan,
    pub results: &'a [ToolResult],
    pub entities: &'a EntitySet,
    pub ambiguities: &'a [Ambiguity],
}

#[derive(Clone, Debug, PartialEq)]
pub struct Synthesis {
    pub reply: String,
    pub confidence: f64,
    pub requires_clarification: bool,
    /// Set when the model call failed and the reply is the generic apology.
    pub failure: Option<OrchestrationError>,
}

impl Synthesis {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
    mode: SynthesisMode,
    timeout: Duration,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>, mode: SynthesisMode) -> Self {
        Self { llm, mode, timeout: DEFAULT_TIMEOUT }
    }

    /// Bounds the model-mode completion; an elapsed call replies with the apology.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> SynthesisMode {
        self.mode
    }

    pub async fn synthesize(&self, input: &SynthesisInput<'_>) -> Synthesis {
        let requires_clarification = input.plan.requires_clarification;
        let confidence = turn_confidence(input.entities, input.results, requires_clarification);

        if requires_clarification {
            let reply = input
                .plan
                .clarification_question
                .clone()
                .unwrap_or_else(|| clarifying_question(input.entities, input.ambiguities));
            return Synthesis { reply, confidence, requires_clarification, failure: None };
        }

        let reply = match self.mode {
            SynthesisMode::Template => render_template(input),
            SynthesisMode::Model => match self.ask_model(input).await {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(
                        event_name = "agent.synthesis.failed",
                        error = %error,
                        "synthesis completion failed; replying with an apology"
                    );
                    return Synthesis {
                        reply: APOLOGY.to_string(),
                        confidence: 0.0,
                        requires_clarification: false,
                        failure: Some(error),
                    };
                }
            },
        };

        Synthesis { reply, confidence, requires_clarification, failure: None }
    }

    async fn ask_model(&self, input: &SynthesisInput<'_>) -> Result<String, OrchestrationError> {
        let acknowledgments = acknowledgments(input);
        let mut prompt = format!("Customer: {}\n\nTool results:\n", input.message);
        if input.results.is_empty() {
            prompt.push_str("(no tools were called)\n");
        }
        for (index, (call, result)) in input.plan.calls.iter().zip(input.results).enumerate() {
            let arguments = serde_json::to_string(&call.arguments).unwrap_or_default();
            match &result.payload {
                Some(payload) if result.is_ok() => prompt.push_str(&format!(
                    "[{}] {}({arguments}) ok: {payload}\n",
                    index + 1,
                    call.tool_name
                )),
                _ => prompt.push_str(&format!(
                    "[{}] {}({arguments}) FAILED: {}\n",
                    index + 1,
                    call.tool_name,
                    result.status.as_str()
                )),
            }
        }
        if !acknowledgments.is_empty() {
            prompt.push_str("\nInclude each of these sentences verbatim:\n");
            for sentence in &acknowledgments {
                prompt.push_str(&format!("- {sentence}\n"));
            }
        }

        let call = self.llm.complete(CompletionRequest {
            purpose: Purpose::Synthesis,
            system: SYNTHESIS_SYSTEM_PROMPT.to_string(),
            prompt,
            schema: None,
        });
        let reply = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                OrchestrationError::SynthesisFailure(format!(
                    "completion timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|error| OrchestrationError::SynthesisFailure(error.to_string()))?
            .into_text();
        let mut reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(OrchestrationError::SynthesisFailure(
                "model returned an empty reply".to_string(),
            ));
        }

        for sentence in acknowledgments {
            if !reply.contains(&sentence) {
                reply.push_str("\n\n");
                reply.push_str(&sentence);
            }
        }
        Ok(reply)
    }
}

/// Weighted blend of entity confidence (0.4) and tool success ratio (0.6),
/// halved when the turn ends in a clarification question.
pub fn turn_confidence(entities: &EntitySet, results: &[ToolResult], clarification: bool) -> f64 {
    let entity_score = entities.mean_confidence().unwrap_or(0.5);
    let success_ratio = if results.is_empty() {
        1.0
    } else {
        results.iter().filter(|result| result.is_ok()).count() as f64 / results.len() as f64
    };
    let confidence = 0.4 * entity_score + 0.6 * success_ratio;
    let confidence = if clarification { confidence / 2.0 } else { confidence };
    confidence.clamp(0.0, 1.0)
}

fn acknowledgments(input: &SynthesisInput<'_>) -> Vec<String> {
    input
        .plan
        .calls
        .iter()
        .zip(input.results)
        .filter(|(_, result)| !result.is_ok())
        .filter_map(|(call, result)| acknowledge_failure(call, result))
        .collect()
}

fn render_template(input: &SynthesisInput<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();
    for (call, result) in input.plan.calls.iter().zip(input.results) {
        match (&result.payload, result.is_ok()) {
            (Some(payload), true) => sections.push(render_success(call, payload)),
            _ => sections.extend(acknowledge_failure(call, result)),
        }
    }
    if sections.is_empty() {
        return GREETING.to_string();
    }
    sections.join("\n\n")
}

fn text<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn argument<'a>(call: &'a ToolCall, key: &str) -> Option<&'a Value> {
    call.arguments.get(key)
}

/// "Sony headphones up to $100" from the search arguments.
fn describe_search(call: &ToolCall) -> String {
    let mut words: Vec<String> = Vec::new();
    for key in ["color", "brand", "query"] {
        if let Some(value) = argument(call, key).and_then(Value::as_str) {
            words.push(value.to_string());
        }
    }
    if words.is_empty() {
        words.push("products".to_string());
    }
    let min = argument(call, "price_min").and_then(Value::as_i64);
    let max = argument(call, "price_max").and_then(Value::as_i64);
    match (min, max) {
        (Some(min), Some(max)) => words.push(format!("between ${min} and ${max}")),
        (Some(min), None) => words.push(format!("from ${min}")),
        (None, Some(max)) => words.push(format!("up to ${max}")),
        (None, None) => {}
    }
    words.join(" ")
}

fn render_success(call: &ToolCall, payload: &Value) -> String {
    match ShopTool::parse(&call.tool_name) {
        Some(ShopTool::SearchProducts) => {
            let products = payload.get("products").and_then(Value::as_array);
            let description = describe_search(call);
            match products.filter(|products| !products.is_empty()) {
                None => format!(
                    "I didn't find any {description}. Would you like me to widen the search?"
                ),
                Some(products) => {
                    let mut lines = vec![format!("Here's what I found for {description}:")];
                    for product in products.iter().take(MAX_LISTED_PRODUCTS) {
                        let stock = if product.get("in_stock").and_then(Value::as_bool) == Some(false) {
                            " (out of stock)"
                        } else {
                            ""
                        };
                        lines.push(format!(
                            "- {} for {}{stock}",
                            text(product, "name").unwrap_or("Unnamed product"),
                            text(product, "price").unwrap_or("an unlisted price"),
                        ));
                    }
                    if products.len() > MAX_LISTED_PRODUCTS {
                        lines.push(format!("...and {} more.", products.len() - MAX_LISTED_PRODUCTS));
                    }
                    lines.join("\n")
                }
            }
        }
        Some(ShopTool::GetProductDetails) => {
            let mut reply = format!(
                "{} costs {}.",
                text(payload, "name").unwrap_or("That product"),
                text(payload, "price").unwrap_or("an unlisted price")
            );
            if let Some(warranty) = text(payload, "warranty") {
                reply.push_str(&format!(" It comes with a {warranty} warranty."));
            }
            if payload.get("in_stock").and_then(Value::as_bool) == Some(false) {
                reply.push_str(" It is currently out of stock.");
            }
            reply
        }
        Some(ShopTool::GetOrderStatus) => {
            let order_id = text(payload, "order_id").unwrap_or("your order");
            let mut reply = format!(
                "Order {order_id} is {}.",
                text(payload, "status").unwrap_or("being processed")
            );
            if let Some(tracking) = text(payload, "tracking_number") {
                reply.push_str(&format!(" Tracking number: {tracking}."));
            }
            if let Some(delivery) = text(payload, "estimated_delivery") {
                reply.push_str(&format!(" Expected delivery: {delivery}."));
            }
            reply
        }
        Some(ShopTool::GetPolicy) => format!(
            "{}: {}",
            text(payload, "title").unwrap_or("Store policy"),
            text(payload, "body").unwrap_or("")
        ),
        Some(ShopTool::GetStoreInfo) => format!(
            "{} is open {}. You can find us at {}.",
            text(payload, "name").unwrap_or("Our store"),
            text(payload, "hours").unwrap_or("during regular hours"),
            text(payload, "address").unwrap_or("our listed address")
        ),
        Some(ShopTool::GetContactInfo) => format!(
            "You can reach our support team at {} or {} ({}).",
            text(payload, "email").unwrap_or("our support email"),
            text(payload, "phone").unwrap_or("our support line"),
            text(payload, "hours").unwrap_or("business hours")
        ),
        Some(ShopTool::GetFaq) => {
            let entries = payload.get("entries").and_then(Value::as_array);
            match entries.filter(|entries| !entries.is_empty()) {
                None => "I don't have an FAQ answer for that yet.".to_string(),
                Some(entries) => entries
                    .iter()
                    .take(2)
                    .map(|entry| {
                        format!(
                            "{} {}",
                            text(entry, "question").unwrap_or(""),
                            text(entry, "answer").unwrap_or("")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            }
        }
        None => payload.to_string(),
    }
}

/// Sentence acknowledging a failed call. Calls skipped behind a failed
/// dependency are covered by the dependency's own acknowledgment.
fn acknowledge_failure(call: &ToolCall, result: &ToolResult) -> Option<String> {
    let kind = result.error_kind();
    if kind == Some(ToolErrorKind::DependencyFailed) {
        return None;
    }
    let not_found = kind == Some(ToolErrorKind::NotFound);

    let sentence = match ShopTool::parse(&call.tool_name) {
        Some(ShopTool::SearchProducts) => format!(
            "I couldn't check live inventory right now, so I can't confirm {} yet. \
             Would you like me to try the search again?",
            describe_search(call)
        ),
        Some(ShopTool::GetProductDetails) => {
            "I couldn't load the details for that product right now.".to_string()
        }
        Some(ShopTool::GetOrderStatus) => {
            let order_id = argument(call, "order_id").and_then(Value::as_str).unwrap_or("that order");
            if not_found {
                format!("I couldn't find order {order_id}. Could you double-check the order number?")
            } else {
                format!("I couldn't look up order {order_id} right now. Please try again in a moment.")
            }
        }
        Some(ShopTool::GetPolicy) => {
            let policy = argument(call, "policy_type").and_then(Value::as_str).unwrap_or("refund");
            if not_found {
                format!("I couldn't find a published {policy} policy.")
            } else {
                format!("I couldn't retrieve our {policy} policy right now.")
            }
        }
        Some(ShopTool::GetStoreInfo) => {
            "I couldn't retrieve our store hours and address right now.".to_string()
        }
        Some(ShopTool::GetContactInfo) => {
            "I couldn't retrieve our contact details right now.".to_string()
        }
        Some(ShopTool::GetFaq) => "I couldn't load our FAQ right now.".to_string(),
        None => format!("I couldn't complete the {} lookup right now.", call.tool_name),
    };
    Some(sentence)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use clerk_core::config::SynthesisMode;
    use clerk_core::domain::entity::EntitySet;
    use clerk_core::domain::plan::Plan;
    use clerk_core::domain::tool::{
        ConcurrencyGroup, ToolArguments, ToolCall, ToolError, ToolResult,
    };
    use clerk_core::errors::OrchestrationError;
    use serde_json::{json, Value};

    use super::{turn_confidence, SynthesisInput, Synthesizer};
    use crate::extractor::PatternStrategy;
    use crate::llm::{LlmClient, ProviderError, Purpose, ScriptedLlm};

    fn call(tool: &str, arguments: &[(&str, Value)]) -> ToolCall {
        let arguments: ToolArguments =
            arguments.iter().map(|(key, value)| (key.to_string(), value.clone())).collect();
        ToolCall::new(tool, arguments, ConcurrencyGroup::Parallel)
    }

    fn search_call() -> ToolCall {
        call(
            "search_products",
            &[("query", json!("headphones")), ("brand", json!("Sony")), ("price_max", json!(100))],
        )
    }

    fn search_payload() -> Value {
        json!({"query": "headphones", "total": 2, "products": [
            {"id": "sony-wh-ch720n", "name": "Sony WH-CH720N Headphones", "brand": "Sony", "price": "$89.99", "in_stock": true},
            {"id": "sony-mdr-zx110", "name": "Sony MDR-ZX110 Headphones", "brand": "Sony", "price": "$19.99", "in_stock": true}
        ]})
    }

    fn synthesizer(llm: &Arc<ScriptedLlm>, mode: SynthesisMode) -> Synthesizer {
        let llm: Arc<dyn LlmClient> = llm.clone();
        Synthesizer::new(llm, mode)
    }

    fn plan(calls: Vec<ToolCall>) -> Plan {
        Plan { calls, reasoning_summary: "test".to_string(), ..Plan::default() }
    }

    #[tokio::test]
    async fn successful_search_lists_matching_products() {
        let llm = Arc::new(ScriptedLlm::new());
        let entities = EntitySet::merge(PatternStrategy.run("Sony headphones under $100").entities);
        let plan = plan(vec![search_call()]);
        let results = vec![ToolResult::ok("search_products", search_payload(), 80, 1)];

        let synthesis = synthesizer(&llm, SynthesisMode::Template)
            .synthesize(&SynthesisInput {
                message: "Sony headphones under $100",
                plan: &plan,
                results: &results,
                entities: &entities,
                ambiguities: &[],
            })
            .await;

        assert!(synthesis.reply.contains("Sony headphones up to $100"));
        assert!(synthesis.reply.contains("$89.99"));
        assert!(!synthesis.requires_clarification);
        assert!(synthesis.confidence > 0.9);
    }

    #[tokio::test]
    async fn timed_out_search_is_acknowledged_with_a_retry_offer() {
        let llm = Arc::new(ScriptedLlm::new());
        let plan = plan(vec![search_call()]);
        let results = vec![ToolResult::failed(
            "search_products",
            ToolError::timeout("turn deadline exceeded"),
            8_000,
            2,
        )];

        let synthesis = synthesizer(&llm, SynthesisMode::Template)
            .synthesize(&SynthesisInput {
                message: "Sony headphones under $100",
                plan: &plan,
                results: &results,
                entities: &EntitySet::new(),
                ambiguities: &[],
            })
            .await;

        assert!(synthesis.reply.contains("couldn't check live inventory"));
        assert!(synthesis.reply.contains("try the search again"));
        assert!(!synthesis.reply.contains("$"));
    }

    #[tokio::test]
    async fn partial_failure_keeps_successful_data() {
        let llm = Arc::new(ScriptedLlm::new());
        let plan = plan(vec![
            call("get_policy", &[("policy_type", json!("refund"))]),
            search_call(),
            call("get_store_info", &[]),
        ]);
        let results = vec![
            ToolResult::ok(
                "get_policy",
                json!({"policy_type": "refund", "title": "Refund and Return Policy", "body": "30 days."}),
                10,
                1,
            ),
            ToolResult::failed("search_products", ToolError::upstream("502"), 900, 3),
            ToolResult::ok(
                "get_store_info",
                json!({"name": "Clerk Demo Store", "hours": "9-5", "address": "100 Market Street"}),
                10,
                1,
            ),
        ];

        let synthesis = synthesizer(&llm, SynthesisMode::Template)
            .synthesize(&SynthesisInput {
                message: "returns, headphones and opening hours",
                plan: &plan,
                results: &results,
                entities: &EntitySet::new(),
                ambiguities: &[],
            })
            .await;

        assert!(synthesis.reply.contains("Refund and Return Policy"));
        assert!(synthesis.reply.contains("Clerk Demo Store"));
        assert!(synthesis.reply.contains("couldn't check live inventory"));
        assert!((synthesis.confidence - (0.4 * 0.5 + 0.6 * (2.0 / 3.0))).abs() < 1e-9);
    }

    #[tokio::test]
    async fn clarification_plans_ask_instead_of_narrating() {
        let llm = Arc::new(ScriptedLlm::new());
        let plan = Plan::clarification("vague", Some("Which product did you mean?".to_string()));

        let synthesis = synthesizer(&llm, SynthesisMode::Model)
            .synthesize(&SynthesisInput {
                message: "that one",
                plan: &plan,
                results: &[],
                entities: &EntitySet::new(),
                ambiguities: &[],
            })
            .await;

        assert_eq!(synthesis.reply, "Which product did you mean?");
        assert!(synthesis.requires_clarification);
        assert!((synthesis.confidence - 0.4).abs() < 1e-9);
        assert!(llm.requests(Purpose::Synthesis).is_empty());
    }

    #[tokio::test]
    async fn model_replies_get_missing_acknowledgments_appended() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_text(Purpose::Synthesis, "Our refund policy gives you 30 days.");
        let plan = plan(vec![call("get_policy", &[("policy_type", json!("refund"))]), search_call()]);
        let results = vec![
            ToolResult::ok("get_policy", json!({"title": "Refund", "body": "30 days"}), 10, 1),
            ToolResult::failed("search_products", ToolError::timeout("slow"), 3_000, 3),
        ];

        let synthesis = synthesizer(&llm, SynthesisMode::Model)
            .synthesize(&SynthesisInput {
                message: "refunds and sony headphones",
                plan: &plan,
                results: &results,
                entities: &EntitySet::new(),
                ambiguities: &[],
            })
            .await;

        assert!(synthesis.reply.starts_with("Our refund policy gives you 30 days."));
        assert!(synthesis.reply.contains("couldn't check live inventory"));
        let prompt = &llm.requests(Purpose::Synthesis)[0].prompt;
        assert!(prompt.contains("FAILED: timeout"));
    }

    #[tokio::test]
    async fn model_failure_returns_an_apology_with_zero_confidence() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(Purpose::Synthesis, Err(ProviderError::transient("timeout")));
        let plan = plan(vec![search_call()]);
        let results = vec![ToolResult::ok("search_products", search_payload(), 80, 1)];

        let synthesis = synthesizer(&llm, SynthesisMode::Model)
            .synthesize(&SynthesisInput {
                message: "Sony headphones under $100",
                plan: &plan,
                results: &results,
                entities: &EntitySet::new(),
                ambiguities: &[],
            })
            .await;

        assert!(synthesis.is_failed());
        assert_eq!(synthesis.confidence, 0.0);
        assert!(synthesis.reply.starts_with("I'm sorry"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_model_call_times_out_into_the_apology() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.stall(Purpose::Synthesis);
        let plan = plan(vec![search_call()]);
        let results = vec![ToolResult::ok("search_products", search_payload(), 80, 1)];
        let synthesizer =
            synthesizer(&llm, SynthesisMode::Model).with_timeout(Duration::from_millis(1_200));

        let started = tokio::time::Instant::now();
        let synthesis = synthesizer
            .synthesize(&SynthesisInput {
                message: "Sony headphones under $100",
                plan: &plan,
                results: &results,
                entities: &EntitySet::new(),
                ambiguities: &[],
            })
            .await;

        assert!(started.elapsed() >= Duration::from_millis(1_200));
        assert_eq!(synthesis.confidence, 0.0);
        assert!(synthesis.reply.starts_with("I'm sorry"));
        assert!(matches!(
            synthesis.failure,
            Some(OrchestrationError::SynthesisFailure(ref reason)) if reason.contains("timed out")
        ));
    }

    #[test]
    fn confidence_blends_entities_and_success_ratio() {
        let entities = EntitySet::merge(PatternStrategy.run("Sony headphones").entities);
        let all_ok = vec![ToolResult::ok("get_faq", json!({}), 1, 1)];
        let all_failed = vec![ToolResult::failed("get_faq", ToolError::upstream("x"), 1, 3)];

        assert!((turn_confidence(&entities, &all_ok, false) - (0.4 * 0.9 + 0.6)).abs() < 1e-9);
        assert!((turn_confidence(&entities, &all_failed, false) - 0.36).abs() < 1e-9);
        assert!((turn_confidence(&EntitySet::new(), &[], true) - 0.4).abs() < 1e-9);
    }
}
