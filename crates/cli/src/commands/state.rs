use chrono::{DateTime, Utc};
use clerk_core::config::LoadOptions;
use clerk_core::domain::conversation::{ConversationId, TurnStage};
use clerk_core::store::ConversationStore;
use clerk_db::{connect_with_config, migrations, SqlConversationStore};
use serde::Serialize;

use crate::commands::{async_runtime, load_config, CommandResult};

#[derive(Debug, Serialize)]
struct CheckpointSummary {
    version: u64,
    stage: TurnStage,
    turn_index: u32,
    created_at: DateTime<Utc>,
}

/// Prints the latest stored state of a conversation, or its checkpoint trail
/// with `history`.
pub fn run(options: &LoadOptions, conversation_id: &str, history: bool) -> CommandResult {
    let config = match load_config("state", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match async_runtime("state") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let id = ConversationId::new(conversation_id);

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return CommandResult::failure("state", "db_connectivity", error.to_string(), 4)
            }
        };
        if let Err(error) = migrations::run_pending(&pool).await {
            return CommandResult::failure("state", "migration", error.to_string(), 5);
        }
        let store = SqlConversationStore::new(pool);

        if history {
            return match store.history(&id).await {
                Ok(records) if records.is_empty() => not_found(&id),
                Ok(records) => {
                    let summaries: Vec<CheckpointSummary> = records
                        .iter()
                        .map(|record| CheckpointSummary {
                            version: record.version,
                            stage: record.stage,
                            turn_index: record.state.turn_index,
                            created_at: record.created_at,
                        })
                        .collect();
                    CommandResult::document("state", &summaries)
                }
                Err(error) => CommandResult::failure("state", "state_store", error.to_string(), 6),
            };
        }

        match store.load(&id).await {
            Ok(Some(state)) => CommandResult::document("state", &state),
            Ok(None) => not_found(&id),
            Err(error) => CommandResult::failure("state", "state_store", error.to_string(), 6),
        }
    })
}

fn not_found(id: &ConversationId) -> CommandResult {
    CommandResult::failure("state", "not_found", format!("no stored conversation `{id}`"), 1)
}
