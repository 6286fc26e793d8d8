use chrono::{DateTime, Utc};
use clerk_core::domain::conversation::{ConversationId, ConversationState, TurnStage};
use clerk_core::errors::StoreError;
use clerk_core::store::{CheckpointRecord, ConversationStore};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::warn;

use super::RepositoryError;
use crate::DbPool;

/// SQLite-backed conversation store. The latest snapshot lives in
/// `conversation_state`; every checkpoint is also appended to
/// `conversation_checkpoint` in the same transaction.
pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn stored_version(&self, id: &ConversationId) -> Result<u64, RepositoryError> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT checkpoint_version FROM conversation_state WHERE conversation_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        version.map_or(Ok(0), |version| parse_u64("checkpoint_version", version))
    }

    async fn write_checkpoint(
        &self,
        state: &ConversationState,
        stage: TurnStage,
    ) -> Result<Option<u64>, RepositoryError> {
        let expected = state.checkpoint_version;
        let version = expected + 1;
        let mut snapshot = state.clone();
        snapshot.checkpoint_version = version;
        let state_json = serde_json::to_string(&snapshot)
            .map_err(|error| RepositoryError::Decode(format!("encode conversation state: {error}")))?;
        let now = Utc::now().to_rfc3339();
        let version_i64 = to_i64("checkpoint_version", version)?;

        let mut tx = self.pool.begin().await?;

        let written = if expected == 0 {
            sqlx::query(
                "INSERT INTO conversation_state (
                    conversation_id,
                    checkpoint_version,
                    stage,
                    turn_index,
                    escalated,
                    state_json,
                    created_at,
                    updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(conversation_id) DO NOTHING",
            )
            .bind(state.conversation_id.as_str())
            .bind(version_i64)
            .bind(stage.as_str())
            .bind(i64::from(state.turn_index))
            .bind(state.escalation_flag)
            .bind(&state_json)
            .bind(state.created_at.to_rfc3339())
            .bind(&now)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE conversation_state SET
                    checkpoint_version = ?,
                    stage = ?,
                    turn_index = ?,
                    escalated = ?,
                    state_json = ?,
                    updated_at = ?
                 WHERE conversation_id = ? AND checkpoint_version = ?",
            )
            .bind(version_i64)
            .bind(stage.as_str())
            .bind(i64::from(state.turn_index))
            .bind(state.escalation_flag)
            .bind(&state_json)
            .bind(&now)
            .bind(state.conversation_id.as_str())
            .bind(to_i64("checkpoint_version", expected)?)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if written == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            "INSERT INTO conversation_checkpoint (
                conversation_id,
                version,
                stage,
                state_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(state.conversation_id.as_str())
        .bind(version_i64)
        .bind(stage.as_str())
        .bind(&state_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(version))
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<ConversationState>, StoreError> {
        let row = sqlx::query("SELECT state_json FROM conversation_state WHERE conversation_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.map(|row| decode_state(&row)).transpose()?)
    }

    async fn checkpoint(
        &self,
        state: &ConversationState,
        stage: TurnStage,
    ) -> Result<u64, StoreError> {
        if let Some(version) = self.write_checkpoint(state, stage).await? {
            return Ok(version);
        }

        let found = self.stored_version(&state.conversation_id).await?;
        warn!(
            event_name = "db.checkpoint.conflict",
            conversation_id = %state.conversation_id,
            expected = state.checkpoint_version,
            found,
            stage = stage.as_str(),
            "stale checkpoint rejected"
        );
        Err(StoreError::Conflict {
            conversation_id: state.conversation_id.to_string(),
            expected: state.checkpoint_version,
            found,
        })
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<CheckpointRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT
                conversation_id,
                version,
                stage,
                state_json,
                created_at
             FROM conversation_checkpoint
             WHERE conversation_id = ?
             ORDER BY version ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(checkpoint_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

fn decode_state(row: &SqliteRow) -> Result<ConversationState, RepositoryError> {
    let raw: String = row.try_get("state_json")?;
    serde_json::from_str(&raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid conversation state json: {error}")))
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<CheckpointRecord, RepositoryError> {
    let stage_raw: String = row.try_get("stage")?;
    let stage = TurnStage::parse(&stage_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown turn stage `{stage_raw}`")))?;

    Ok(CheckpointRecord {
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        version: parse_u64("version", row.try_get("version")?)?,
        stage,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        state: decode_state(row)?,
    })
}

fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{column} must be non-negative, got {value}")))
}

fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{column} {value} does not fit the column")))
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid {column} `{value}`: {error}")))
}
