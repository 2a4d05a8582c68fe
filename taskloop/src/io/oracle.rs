//! Decision oracle abstraction.
//!
//! The [`DecisionOracle`] trait decouples the loop from whatever actually makes
//! decisions (a hosted model, a local command, a scripted stub in tests). Every
//! operation may fail or stall; callers are responsible for degrading to a
//! safe default, never the oracle.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::types::{ActionArgs, ActionCall, ActionRecord, ActionSpec};

/// The external black box that plans, chooses actions, judges completion and
/// writes the final answer.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Break `query` into ordered task descriptions. An empty list means the
    /// query is out of scope for the available actions.
    async fn plan(
        &self,
        query: &str,
        actions: &[ActionSpec],
        context: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Choose the next action for `task`, or `None` when the task is complete.
    async fn next_action(
        &self,
        task: &str,
        actions: &[ActionSpec],
        history: &[ActionRecord],
    ) -> Result<Option<ActionCall>>;

    /// Judge whether `recent` results resolve `task`.
    async fn is_done(&self, task: &str, recent: &[ActionRecord]) -> Result<bool>;

    /// Refine raw arguments for `action` given the task and the declared schema.
    async fn optimize_args(
        &self,
        action: &str,
        args: &ActionArgs,
        task: &str,
        schema: &Value,
    ) -> Result<ActionArgs>;

    /// Write the final answer from every collected output.
    async fn synthesize(
        &self,
        query: &str,
        outputs: &[ActionRecord],
        partial: bool,
    ) -> Result<String>;
}
