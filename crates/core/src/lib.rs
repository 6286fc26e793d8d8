pub mod config;
pub mod domain;
pub mod errors;
pub mod execution_engine;
pub mod store;

pub use domain::conversation::{
    CompletedTurn, ConversationId, ConversationState, PendingTurn, TurnStage, TurnSummary,
};
pub use domain::entity::{Ambiguity, Entity, EntityLabel, EntitySet, EntitySource, EntityValue};
pub use domain::plan::{Plan, PlanOrigin};
pub use domain::tool::{
    ConcurrencyGroup, Fingerprint, ToolArguments, ToolCall, ToolError, ToolErrorKind, ToolResult,
    ToolStatus,
};
pub use errors::{InterfaceError, OrchestrationError, PlanValidationError, StoreError};
pub use execution_engine::{CallLifecycle, CallState, RetryDecision, RetryPolicy};
pub use store::{load_or_new, CheckpointRecord, ConversationStore, InMemoryConversationStore};
