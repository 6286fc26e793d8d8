use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::conversation::{ConversationId, ConversationState, TurnStage};
use crate::errors::StoreError;

/// One durable snapshot of a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub conversation_id: ConversationId,
    pub version: u64,
    pub stage: TurnStage,
    pub created_at: DateTime<Utc>,
    pub state: ConversationState,
}

/// Durable record of conversation state.
///
/// `checkpoint` is optimistic: it succeeds only when the stored version equals
/// `state.checkpoint_version`, and returns the new version.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, id: &ConversationId) -> Result<Option<ConversationState>, StoreError>;

    async fn checkpoint(
        &self,
        state: &ConversationState,
        stage: TurnStage,
    ) -> Result<u64, StoreError>;

    async fn history(&self, id: &ConversationId) -> Result<Vec<CheckpointRecord>, StoreError>;
}

/// Loads the stored state or starts a fresh one.
pub async fn load_or_new<S>(store: &S, id: &ConversationId) -> Result<ConversationState, StoreError>
where
    S: ConversationStore + ?Sized,
{
    Ok(store.load(id).await?.unwrap_or_else(|| ConversationState::new(id.clone())))
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    records: Mutex<HashMap<ConversationId, Vec<CheckpointRecord>>>,
    fail_writes: AtomicBool,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following checkpoint fail with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_writes.store(unavailable, Ordering::SeqCst);
    }

    pub fn checkpoint_count(&self, id: &ConversationId) -> usize {
        self.records.lock().get(id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<ConversationState>, StoreError> {
        let records = self.records.lock();
        Ok(records.get(id).and_then(|history| history.last()).map(|record| record.state.clone()))
    }

    async fn checkpoint(
        &self,
        state: &ConversationState,
        stage: TurnStage,
    ) -> Result<u64, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store marked unavailable".to_string()));
        }

        let mut records = self.records.lock();
        let history = records.entry(state.conversation_id.clone()).or_default();
        let found = history.last().map_or(0, |record| record.version);
        if found != state.checkpoint_version {
            return Err(StoreError::Conflict {
                conversation_id: state.conversation_id.to_string(),
                expected: state.checkpoint_version,
                found,
            });
        }

        let version = found + 1;
        let mut snapshot = state.clone();
        snapshot.checkpoint_version = version;
        history.push(CheckpointRecord {
            conversation_id: state.conversation_id.clone(),
            version,
            stage,
            created_at: Utc::now(),
            state: snapshot,
        });
        Ok(version)
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<CheckpointRecord>, StoreError> {
        Ok(self.records.lock().get(id).cloned().unwrap_or_default())
    }
}
