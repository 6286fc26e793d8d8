use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clerk_agent::demo::DemoShop;
use clerk_agent::llm::{client_from_config, LlmClient, OfflineLlm};
use clerk_agent::runtime::{AgentRuntime, TurnOutcome};
use clerk_core::config::{AppConfig, LoadOptions};
use clerk_core::domain::conversation::ConversationId;
use clerk_core::errors::{InterfaceError, OrchestrationError};
use clerk_db::{connect_with_config, migrations, SqlConversationStore};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::commands::{async_runtime, load_config, CommandResult};
use crate::logging::init_logging;

#[derive(Debug, Serialize)]
struct TurnDocument {
    conversation_id: String,
    correlation_id: String,
    turn_index: u32,
    reply: String,
    confidence: f64,
    requires_clarification: bool,
    escalate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    escalation_reason: Option<String>,
    resumed: bool,
    tools: Vec<ToolDocument>,
    /// Failures the turn recovered from, as the interface would classify them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    recovered: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ToolDocument {
    tool: String,
    status: &'static str,
    latency_ms: u64,
    attempts: u32,
    from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&TurnOutcome> for TurnDocument {
    fn from(outcome: &TurnOutcome) -> Self {
        Self {
            conversation_id: outcome.conversation_id.to_string(),
            correlation_id: outcome.correlation_id.clone(),
            turn_index: outcome.state.turn_index,
            reply: outcome.reply.clone(),
            confidence: outcome.confidence,
            requires_clarification: outcome.requires_clarification,
            escalate: outcome.escalate,
            escalation_reason: outcome.escalation_reason.clone(),
            resumed: outcome.resumed,
            tools: outcome
                .results
                .iter()
                .map(|result| ToolDocument {
                    tool: result.tool_name.clone(),
                    status: result.status.as_str(),
                    latency_ms: result.latency_ms,
                    attempts: result.attempt_count,
                    from_cache: result.from_cache,
                    error: result.error_detail.as_ref().map(ToString::to_string),
                })
                .collect(),
            recovered: outcome
                .recovered
                .iter()
                .map(|error| InterfaceError::from(error.clone()).to_string())
                .collect(),
        }
    }
}

/// Runs `messages` as consecutive turns of one conversation and prints one
/// document per turn. With no messages, reads turns from stdin until EOF.
pub fn run(
    options: &LoadOptions,
    conversation_id: Option<String>,
    messages: Vec<String>,
) -> CommandResult {
    let config = match load_config("chat", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    init_logging(&config);
    let async_rt = match async_runtime("chat") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let conversation_id =
        ConversationId::new(conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string()));

    async_rt.block_on(async {
        let runtime = match build_runtime(&config).await {
            Ok(runtime) => runtime,
            Err(failure) => return failure,
        };

        if messages.is_empty() {
            return interactive(&runtime, &conversation_id).await;
        }

        let mut turns = Vec::with_capacity(messages.len());
        for message in &messages {
            match runtime.handle_turn(&conversation_id, message).await {
                Ok(outcome) => turns.push(TurnDocument::from(&outcome)),
                Err(error) => return turn_failure(error),
            }
        }
        CommandResult::document("chat", &turns)
    })
}

async fn build_runtime(config: &AppConfig) -> Result<AgentRuntime, CommandResult> {
    let pool = connect_with_config(&config.database).await.map_err(|error| {
        CommandResult::failure("chat", "db_connectivity", error.to_string(), 4)
    })?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| CommandResult::failure("chat", "migration", error.to_string(), 5))?;

    let llm: Arc<dyn LlmClient> = match client_from_config(&config.llm) {
        Ok(client) => client,
        Err(error) => {
            warn!(
                event_name = "cli.chat.llm_unavailable",
                error = %error,
                "model client unavailable, continuing offline"
            );
            Arc::new(OfflineLlm)
        }
    };

    Ok(AgentRuntime::from_config(
        config,
        llm,
        Arc::new(DemoShop::new()),
        Arc::new(SqlConversationStore::new(pool)),
    ))
}

async fn interactive(runtime: &AgentRuntime, conversation_id: &ConversationId) -> CommandResult {
    let stdin = io::stdin();
    let mut turns = 0usize;
    eprintln!("conversation {conversation_id} (Ctrl-D to finish)");

    loop {
        eprint!("> ");
        let _ = io::stderr().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => return CommandResult::failure("chat", "io", error.to_string(), 1),
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        match runtime.handle_turn(conversation_id, message).await {
            Ok(outcome) => {
                println!("{}", outcome.reply);
                turns += 1;
            }
            Err(error) => return turn_failure(error),
        }
    }

    CommandResult::success(
        "chat",
        format!("conversation {conversation_id} ended after {turns} turn(s)"),
    )
}

fn turn_failure(error: OrchestrationError) -> CommandResult {
    let interface = error.into_interface(Uuid::new_v4().to_string());
    CommandResult::failure(
        "chat",
        "state_store",
        format!("{} (correlation id {})", interface.user_message(), interface.correlation_id()),
        6,
    )
}
