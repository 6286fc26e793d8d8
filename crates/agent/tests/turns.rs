use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clerk_agent::demo::DemoShop;
use clerk_agent::llm::{LlmClient, OfflineLlm, Purpose, ScriptedLlm};
use clerk_agent::runtime::AgentRuntime;
use clerk_agent::tools::ShopTool;
use clerk_core::config::{AppConfig, LlmProvider, SynthesisMode};
use clerk_core::domain::conversation::{ConversationId, ConversationState, TurnStage};
use clerk_core::domain::entity::EntityLabel;
use clerk_core::domain::plan::PlanOrigin;
use clerk_core::domain::tool::{ToolError, ToolErrorKind};
use clerk_core::errors::{OrchestrationError, StoreError};
use clerk_core::store::{CheckpointRecord, ConversationStore, InMemoryConversationStore};
use parking_lot::Mutex;
use serde_json::json;

fn offline_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.llm.provider = LlmProvider::Offline;
    config
}

fn offline_runtime(shop: &Arc<DemoShop>, store: Arc<dyn ConversationStore>) -> AgentRuntime {
    let llm: Arc<dyn LlmClient> = Arc::new(OfflineLlm);
    AgentRuntime::from_config(&offline_config(), llm, shop.clone(), store)
}

async fn stages(store: &dyn ConversationStore, id: &ConversationId) -> Vec<TurnStage> {
    store.history(id).await.expect("history").iter().map(|record| record.stage).collect()
}

/// Fails the first checkpoint written at `fail_at`, then behaves normally.
struct FlakyStore {
    inner: InMemoryConversationStore,
    fail_at: Mutex<Option<TurnStage>>,
}

impl FlakyStore {
    fn failing_at(stage: TurnStage) -> Self {
        Self { inner: InMemoryConversationStore::new(), fail_at: Mutex::new(Some(stage)) }
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<ConversationState>, StoreError> {
        self.inner.load(id).await
    }

    async fn checkpoint(
        &self,
        state: &ConversationState,
        stage: TurnStage,
    ) -> Result<u64, StoreError> {
        let fail = {
            let mut fail_at = self.fail_at.lock();
            if *fail_at == Some(stage) {
                fail_at.take();
                true
            } else {
                false
            }
        };
        if fail {
            return Err(StoreError::Backend("disk unavailable".to_string()));
        }
        self.inner.checkpoint(state, stage).await
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<CheckpointRecord>, StoreError> {
        self.inner.history(id).await
    }
}

#[tokio::test]
async fn budget_headphone_search_lists_only_matching_products() {
    let shop = Arc::new(DemoShop::new());
    let store = Arc::new(InMemoryConversationStore::new());
    let runtime = offline_runtime(&shop, store.clone());
    let id = ConversationId::new("c-headline");

    let outcome = runtime.handle_turn(&id, "Sony headphones under $100").await.expect("turn");

    assert_eq!(outcome.plan.calls.len(), 1);
    let call = &outcome.plan.calls[0];
    assert_eq!(call.tool_name, "search_products");
    assert_eq!(call.arguments.get("brand"), Some(&json!("Sony")));
    assert_eq!(call.arguments.get("price_max"), Some(&json!(100)));

    assert!(outcome.reply.contains("$89.99"));
    assert!(outcome.reply.contains("$19.99"));
    assert!(!outcome.reply.contains("$349.99"));
    assert!(!outcome.reply.contains("Bose"));
    assert!(!outcome.requires_clarification);
    assert!(!outcome.escalate);
    assert!(outcome.confidence > 0.8);

    assert_eq!(outcome.state.turn_index, 1);
    assert!(outcome.state.pending_turn.is_none());
    assert_eq!(
        stages(store.as_ref(), &id).await,
        vec![TurnStage::Extracted, TurnStage::Planned, TurnStage::Executed, TurnStage::Completed]
    );
}

#[tokio::test]
async fn price_range_is_passed_to_the_search() {
    let shop = Arc::new(DemoShop::new());
    let runtime = offline_runtime(&shop, Arc::new(InMemoryConversationStore::new()));

    let outcome = runtime
        .handle_turn(&ConversationId::new("c-range"), "laptops between $500 and $1000")
        .await
        .expect("turn");

    let call = &outcome.plan.calls[0];
    assert_eq!(call.arguments.get("price_min"), Some(&json!(500)));
    assert_eq!(call.arguments.get("price_max"), Some(&json!(1000)));
    assert!(outcome.reply.contains("Lenovo IdeaPad 3"));
    assert!(outcome.reply.contains("Dell XPS 13"));
}

#[tokio::test(start_paused = true)]
async fn slow_inventory_is_acknowledged_instead_of_guessed() {
    let shop = Arc::new(DemoShop::new());
    shop.set_latency(ShopTool::SearchProducts, Duration::from_secs(10));
    let runtime = offline_runtime(&shop, Arc::new(InMemoryConversationStore::new()));

    let outcome = runtime
        .handle_turn(&ConversationId::new("c-timeout"), "Sony headphones under $100")
        .await
        .expect("turn");

    assert_eq!(outcome.results[0].error_kind(), Some(ToolErrorKind::Timeout));
    assert!(outcome.reply.contains("couldn't check live inventory"));
    assert!(!outcome.reply.contains("$89.99"));
    assert_eq!(outcome.state.consecutive_tool_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn one_failed_call_does_not_hide_the_others() {
    let shop = Arc::new(DemoShop::new());
    for _ in 0..3 {
        shop.fail_next(ShopTool::SearchProducts, ToolError::upstream("inventory service returned 503"));
    }
    let runtime = offline_runtime(&shop, Arc::new(InMemoryConversationStore::new()));

    let outcome = runtime
        .handle_turn(
            &ConversationId::new("c-partial"),
            "What's your return policy, your store hours, and do you have Sony headphones?",
        )
        .await
        .expect("turn");

    let tools: Vec<&str> = outcome.plan.calls.iter().map(|call| call.tool_name.as_str()).collect();
    assert_eq!(tools, vec!["search_products", "get_policy", "get_store_info"]);
    assert_eq!(shop.calls(ShopTool::SearchProducts), 3);
    assert!(!outcome.results[0].is_ok());
    assert!(outcome.results[1].is_ok());
    assert!(outcome.results[2].is_ok());

    assert!(outcome.reply.contains("Refund"));
    assert!(outcome.reply.contains("Clerk Demo Store"));
    assert!(outcome.reply.contains("couldn't check live inventory"));
    assert!(matches!(
        outcome.recovered.as_slice(),
        [OrchestrationError::Tool(ToolError { kind: ToolErrorKind::Upstream, .. })]
    ));
}

#[tokio::test]
async fn third_negative_turn_in_a_row_escalates_and_stays_escalated() {
    let shop = Arc::new(DemoShop::new());
    let runtime = offline_runtime(&shop, Arc::new(InMemoryConversationStore::new()));
    let id = ConversationId::new("c-upset");

    let first = runtime.handle_turn(&id, "Order 1001 is late and this is terrible").await.expect("turn 1");
    assert!(!first.escalate);
    let second = runtime.handle_turn(&id, "Still waiting on order 1001, awful").await.expect("turn 2");
    assert!(!second.escalate);

    let third = runtime.handle_turn(&id, "Order 1001 again? This is ridiculous").await.expect("turn 3");
    assert!(third.escalate);
    assert_eq!(third.escalation_reason.as_deref(), Some("negative_sentiment_streak"));
    assert!(third.reply.contains("support team"));

    let fourth = runtime.handle_turn(&id, "thanks, that is great").await.expect("turn 4");
    assert!(fourth.escalate);
    assert_eq!(fourth.state.sentiment_trend.len(), 4);
}

#[tokio::test]
async fn asking_for_a_human_escalates_immediately() {
    let shop = Arc::new(DemoShop::new());
    let runtime = offline_runtime(&shop, Arc::new(InMemoryConversationStore::new()));

    let outcome = runtime
        .handle_turn(&ConversationId::new("c-human"), "I want to talk to a human about order 1001")
        .await
        .expect("turn");

    assert!(outcome.escalate);
    assert_eq!(outcome.escalation_reason.as_deref(), Some("explicit_request"));
    assert!(outcome.state.escalation_flag);
}

#[tokio::test]
async fn repeated_question_is_answered_from_the_cache() {
    let shop = Arc::new(DemoShop::new());
    let runtime = offline_runtime(&shop, Arc::new(InMemoryConversationStore::new()));
    let id = ConversationId::new("c-cache");

    let first = runtime.handle_turn(&id, "What are your store hours?").await.expect("turn 1");
    let second = runtime.handle_turn(&id, "What are your store hours?").await.expect("turn 2");

    assert_eq!(shop.calls(ShopTool::GetStoreInfo), 1);
    assert!(!first.results[0].from_cache);
    assert!(second.results[0].from_cache);
    assert_eq!(first.reply, second.reply);
}

#[tokio::test]
async fn interrupted_turn_resumes_from_its_last_checkpoint() {
    let shop = Arc::new(DemoShop::new());
    let store = Arc::new(FlakyStore::failing_at(TurnStage::Executed));
    let runtime = offline_runtime(&shop, store.clone());
    let id = ConversationId::new("c-resume");

    let error = runtime.handle_turn(&id, "Sony headphones under $100").await.expect_err("store down");
    assert!(matches!(error, OrchestrationError::StateStore(StoreError::Backend(_))));
    assert!(error.is_fatal_to_turn());

    let interrupted = runtime.state(&id).await.expect("load").expect("saved state");
    let pending = interrupted.pending_turn.expect("pending turn");
    assert_eq!(pending.stage, TurnStage::Planned);

    let outcome = runtime.handle_turn(&id, "Sony headphones under $100").await.expect("resumed turn");
    assert!(outcome.resumed);
    assert_eq!(outcome.correlation_id, pending.correlation_id);
    assert_eq!(outcome.state.turn_index, 1);
    assert!(outcome.reply.contains("$89.99"));
    assert_eq!(shop.calls(ShopTool::SearchProducts), 1);
}

#[tokio::test]
async fn a_new_message_discards_an_interrupted_turn() {
    let shop = Arc::new(DemoShop::new());
    let store = Arc::new(FlakyStore::failing_at(TurnStage::Planned));
    let runtime = offline_runtime(&shop, store.clone());
    let id = ConversationId::new("c-supersede");

    runtime.handle_turn(&id, "Sony headphones under $100").await.expect_err("store down");
    let outcome = runtime.handle_turn(&id, "What are your store hours?").await.expect("new turn");

    assert!(!outcome.resumed);
    assert_eq!(outcome.plan.calls[0].tool_name, "get_store_info");
    assert_eq!(outcome.state.recent_turns.len(), 1);
    assert_eq!(outcome.state.recent_turns[0].user_message, "What are your store hours?");
}

#[tokio::test]
async fn plans_naming_unknown_tools_end_in_clarification() {
    let shop = Arc::new(DemoShop::new());
    let llm = Arc::new(ScriptedLlm::new());
    let rogue = json!({
        "calls": [{"tool": "delete_all_orders", "arguments": {}}],
        "reasoning_summary": "customer wants everything gone"
    });
    llm.push_json(Purpose::Planning, rogue.clone()).push_json(Purpose::Planning, rogue);

    let mut config = AppConfig::default();
    config.extraction.model_strategy = false;
    let client: Arc<dyn LlmClient> = llm.clone();
    let runtime = AgentRuntime::from_config(
        &config,
        client,
        shop.clone(),
        Arc::new(InMemoryConversationStore::new()),
    );

    let outcome =
        runtime.handle_turn(&ConversationId::new("c-rogue"), "cancel everything").await.expect("turn");

    assert!(outcome.requires_clarification);
    assert!(outcome.plan.calls.is_empty());
    assert_eq!(shop.total_calls(), 0);
    assert_eq!(llm.requests(Purpose::Planning).len(), 2);
    assert!(llm.requests(Purpose::Synthesis).is_empty());
    assert_eq!(outcome.recovered.len(), 2);
    assert!(outcome
        .recovered
        .iter()
        .all(|error| matches!(error, OrchestrationError::PlanValidation(_))));
}

fn scripted_runtime(
    llm: &Arc<ScriptedLlm>,
    shop: &Arc<DemoShop>,
    configure: impl FnOnce(&mut AppConfig),
) -> AgentRuntime {
    let mut config = AppConfig::default();
    config.extraction.model_strategy = false;
    configure(&mut config);
    let client: Arc<dyn LlmClient> = llm.clone();
    AgentRuntime::from_config(&config, client, shop.clone(), Arc::new(InMemoryConversationStore::new()))
}

#[tokio::test(start_paused = true)]
async fn stalled_planning_call_falls_back_to_the_heuristic_plan() {
    let shop = Arc::new(DemoShop::new());
    let llm = Arc::new(ScriptedLlm::new());
    llm.stall(Purpose::Planning);
    let runtime = scripted_runtime(&llm, &shop, |config| {
        config.planner.timeout_ms = 2_000;
        config.synthesis.mode = SynthesisMode::Template;
    });

    let started = tokio::time::Instant::now();
    let outcome = runtime
        .handle_turn(&ConversationId::new("c-stalled-plan"), "Sony headphones under $100")
        .await
        .expect("turn");

    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert_eq!(outcome.plan.origin, PlanOrigin::Heuristic);
    assert!(outcome.reply.contains("$89.99"));
    assert_eq!(llm.requests(Purpose::Planning).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_synthesis_call_replies_with_an_apology() {
    let shop = Arc::new(DemoShop::new());
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_json(
        Purpose::Planning,
        json!({
            "calls": [{"tool": "get_store_info", "arguments": {}}],
            "reasoning_summary": "store hours"
        }),
    );
    llm.stall(Purpose::Synthesis);
    let runtime = scripted_runtime(&llm, &shop, |config| config.synthesis.timeout_ms = 1_500);

    let outcome = runtime
        .handle_turn(&ConversationId::new("c-stalled-reply"), "What are your store hours?")
        .await
        .expect("turn");

    assert!(outcome.reply.starts_with("I'm sorry"));
    assert_eq!(outcome.confidence, 0.0);
    assert!(outcome.results[0].is_ok());
    assert!(matches!(outcome.recovered.as_slice(), [OrchestrationError::SynthesisFailure(_)]));
    assert_eq!(outcome.state.turn_index, 1);
}

#[tokio::test]
async fn finished_conversations_release_their_turn_locks() {
    let shop = Arc::new(DemoShop::new());
    let runtime = Arc::new(offline_runtime(&shop, Arc::new(InMemoryConversationStore::new())));

    for index in 0..20 {
        let id = ConversationId::new(format!("c-lock-{index}"));
        runtime.handle_turn(&id, "What are your store hours?").await.expect("turn");
    }
    assert_eq!(runtime.active_conversations(), 0);

    let id = ConversationId::new("c-lock-shared");
    let (first, second) = tokio::join!(
        runtime.handle_turn(&id, "What are your store hours?"),
        runtime.handle_turn(&id, "What's your return policy?"),
    );
    first.expect("turn 1");
    second.expect("turn 2");
    assert_eq!(runtime.active_conversations(), 0);
    assert_eq!(runtime.state(&id).await.expect("load").expect("state").turn_index, 2);
}

#[tokio::test]
async fn conversations_do_not_share_entities() {
    let shop = Arc::new(DemoShop::new());
    let runtime = Arc::new(offline_runtime(&shop, Arc::new(InMemoryConversationStore::new())));

    let conv_a = ConversationId::new("c-a");
    let conv_b = ConversationId::new("c-b");
    let (sony, status) = tokio::join!(
        runtime.handle_turn(&conv_a, "Sony headphones under $100"),
        runtime.handle_turn(&conv_b, "where is order #1002?"),
    );
    let sony = sony.expect("turn a");
    let status = status.expect("turn b");

    assert_eq!(sony.plan.calls[0].tool_name, "search_products");
    assert_eq!(status.plan.calls[0].tool_name, "get_order_status");
    let entities = status.state.last_entities().expect("entities recorded");
    assert_eq!(entities.text(EntityLabel::Brand), None);
    assert_eq!(entities.text(EntityLabel::OrderId), Some("1002"));
}
