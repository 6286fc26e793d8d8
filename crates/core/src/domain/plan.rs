use serde::{Deserialize, Serialize};

use crate::domain::tool::ToolCall;
use crate::errors::PlanValidationError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    /// Accepted on the first reasoning call.
    #[default]
    Model,
    /// Accepted after the stricter second attempt.
    ModelRetry,
    /// Built from entities because the model was unreachable.
    Heuristic,
    /// No usable plan; the turn asks for clarification.
    Fallback,
}

impl PlanOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::ModelRetry => "model_retry",
            Self::Heuristic => "heuristic",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub calls: Vec<ToolCall>,
    pub reasoning_summary: String,
    pub requires_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
    #[serde(default)]
    pub origin: PlanOrigin,
    /// Model answers rejected before this plan was settled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<PlanValidationError>,
}

impl Plan {
    pub fn clarification(reasoning_summary: impl Into<String>, question: Option<String>) -> Self {
        Self {
            calls: Vec::new(),
            reasoning_summary: reasoning_summary.into(),
            requires_clarification: true,
            clarification_question: question,
            origin: PlanOrigin::Fallback,
            rejections: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Groups call indexes into dependency levels. Every call in level `n`
    /// depends only on calls in earlier levels. Dependencies must point at
    /// earlier indexes; the planner rejects anything else before execution.
    pub fn execution_levels(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.calls.len()];
        for (index, call) in self.calls.iter().enumerate() {
            depth[index] = call
                .depends_on
                .iter()
                .filter(|dependency| **dependency < index)
                .map(|dependency| depth[*dependency] + 1)
                .max()
                .unwrap_or(0);
        }

        let levels = depth.iter().copied().max().map_or(0, |deepest| deepest + 1);
        let mut grouped = vec![Vec::new(); levels];
        for (index, level) in depth.into_iter().enumerate() {
            grouped[level].push(index);
        }
        grouped
    }
}
