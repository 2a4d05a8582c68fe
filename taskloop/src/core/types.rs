//! Shared deterministic types for the task loop.
//!
//! These types define stable contracts between the planner, the loop and the
//! external collaborators. They carry no I/O and serialize deterministically so
//! they can be written into run records unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arguments passed to an action. Key order is irrelevant to the loop; see
/// [`crate::core::repetition::signature`] for the canonical form.
pub type ActionArgs = serde_json::Map<String, Value>;

/// A planned sub-task of the user's query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// 1-indexed position in the plan.
    pub id: u32,
    pub description: String,
    /// Flips false -> true at most once per run.
    pub done: bool,
}

impl Task {
    pub fn new(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            done: false,
        }
    }
}

/// An action selected by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub name: String,
    #[serde(default)]
    pub args: ActionArgs,
}

impl ActionCall {
    pub fn new(name: impl Into<String>, args: ActionArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Outcome of a single action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    /// Either a plain string or structured JSON produced by the action.
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Render the output for prompts and fallback answers.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// One executed step: which task it served, what was called, what came back.
///
/// Records are appended to the per-task and session logs and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub task_id: u32,
    pub call: ActionCall,
    pub result: ActionResult,
}

impl ActionRecord {
    /// Single-line summary used in fallback answers.
    pub fn summary(&self) -> String {
        if self.result.success {
            format!("[{}] {}", self.call.name, self.result.output_text())
        } else {
            format!(
                "[{}] error: {}",
                self.call.name,
                self.result.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// Final text handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// True when the run ended on budget exhaustion or repetition rather than
    /// natural completion.
    pub partial: bool,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every task was resolved (or the plan was empty).
    Completed,
    /// The global step budget ran out.
    BudgetExhausted,
    /// The same action was proposed four times in a row.
    RepetitionDetected,
    /// An unexpected error or panic escaped the loop body.
    Fatal,
}

impl StopReason {
    /// Whether an answer produced for this stop is partial.
    pub fn is_partial(self) -> bool {
        matches!(self, StopReason::BudgetExhausted | StopReason::RepetitionDetected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::RepetitionDetected => "repetition_detected",
            StopReason::Fatal => "fatal",
        }
    }
}

/// Description of a registered action, as shown to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}
