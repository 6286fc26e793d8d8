use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tool::ToolError;

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanValidationError {
    #[error("unknown tool `{tool}`")]
    UnknownTool { tool: String },
    #[error("tool `{tool}` has no argument `{argument}`")]
    UnknownArgument { tool: String, argument: String },
    #[error("tool `{tool}` requires argument `{argument}`")]
    MissingArgument { tool: String, argument: String },
    #[error("tool `{tool}` argument `{argument}` is invalid: {reason}")]
    InvalidArgument { tool: String, argument: String, reason: String },
    #[error("call {index} depends on call {dependency}, which is not an earlier call")]
    InvalidDependency { index: usize, dependency: usize },
    #[error("plan output is malformed: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("checkpoint conflict for `{conversation_id}`: expected version {expected}, found {found}")]
    Conflict { conversation_id: String, expected: u64, found: u64 },
    #[error("state store backend failure: {0}")]
    Backend(String),
    #[error("state store decode failure: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("every extraction strategy failed")]
    ExtractionFailure,
    #[error(transparent)]
    PlanValidation(#[from] PlanValidationError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("response synthesis failed: {0}")]
    SynthesisFailure(String),
    #[error("turn could not be recorded: {0}")]
    StateStore(#[from] StoreError),
}

impl OrchestrationError {
    /// Everything except a store failure is folded into the reply.
    pub fn is_fatal_to_turn(&self) -> bool {
        matches!(self, Self::StateStore(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "Your message could not be saved. Please send it again in a moment."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl OrchestrationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<OrchestrationError> for InterfaceError {
    fn from(value: OrchestrationError) -> Self {
        match value {
            OrchestrationError::PlanValidation(error) => Self::BadRequest {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            OrchestrationError::StateStore(error) => Self::ServiceUnavailable {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            OrchestrationError::Tool(error) if !error.kind.is_transient() => Self::BadRequest {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            OrchestrationError::Tool(error) => Self::ServiceUnavailable {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            OrchestrationError::ExtractionFailure | OrchestrationError::SynthesisFailure(_) => {
                Self::Internal {
                    message: value.to_string(),
                    correlation_id: "unassigned".to_owned(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::tool::ToolError;
    use crate::errors::{InterfaceError, OrchestrationError, PlanValidationError, StoreError};

    #[test]
    fn store_failure_is_the_only_fatal_error() {
        assert!(OrchestrationError::from(StoreError::Backend("disk full".to_owned()))
            .is_fatal_to_turn());
        assert!(!OrchestrationError::ExtractionFailure.is_fatal_to_turn());
        assert!(!OrchestrationError::from(ToolError::upstream("502")).is_fatal_to_turn());
        assert!(!OrchestrationError::SynthesisFailure("timeout".to_owned()).is_fatal_to_turn());
    }

    #[test]
    fn store_failure_maps_to_service_unavailable_with_correlation() {
        let interface = OrchestrationError::from(StoreError::Conflict {
            conversation_id: "c-1".to_owned(),
            expected: 3,
            found: 4,
        })
        .into_interface("req-9");

        assert!(matches!(
            interface,
            InterfaceError::ServiceUnavailable { ref correlation_id, .. } if correlation_id == "req-9"
        ));
        assert_eq!(
            interface.user_message(),
            "Your message could not be saved. Please send it again in a moment."
        );
    }

    #[test]
    fn plan_validation_maps_to_bad_request() {
        let interface = OrchestrationError::from(PlanValidationError::UnknownTool {
            tool: "delete_store".to_owned(),
        })
        .into_interface("req-10");

        assert!(matches!(interface, InterfaceError::BadRequest { .. }));
        assert!(interface.to_string().contains("delete_store"));
        assert_eq!(interface.correlation_id(), "req-10");
    }

    #[test]
    fn tool_errors_split_by_whether_a_retry_could_help() {
        let missing = InterfaceError::from(OrchestrationError::from(ToolError::not_found(
            "no order `9999`",
        )));
        assert!(matches!(missing, InterfaceError::BadRequest { .. }));

        let outage = InterfaceError::from(OrchestrationError::from(ToolError::upstream("503")));
        assert!(matches!(outage, InterfaceError::ServiceUnavailable { .. }));
    }

    #[test]
    fn synthesis_failure_maps_to_internal() {
        let interface =
            OrchestrationError::SynthesisFailure("provider down".to_owned()).into_interface("req-11");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
