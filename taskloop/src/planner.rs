//! Query decomposition into an ordered task list.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::types::{ActionSpec, Task};
use crate::io::bridge::Bridge;
use crate::io::oracle::DecisionOracle;

pub struct TaskPlanner<'a> {
    oracle: &'a dyn DecisionOracle,
    bridge: &'a Bridge,
    timeout: Duration,
}

impl<'a> TaskPlanner<'a> {
    pub fn new(oracle: &'a dyn DecisionOracle, bridge: &'a Bridge, timeout: Duration) -> Self {
        Self {
            oracle,
            bridge,
            timeout,
        }
    }

    /// Ask the oracle for a plan. Never fails: when the oracle does, the
    /// whole query becomes the single task. An empty plan is passed through
    /// untouched; it means the query is out of scope.
    #[instrument(skip_all)]
    pub fn plan(
        &self,
        query: &str,
        actions: &[ActionSpec],
        prior_context: Option<&str>,
    ) -> Vec<Task> {
        let descriptions = match self.bridge.call(
            "plan",
            self.timeout,
            self.oracle.plan(query, actions, prior_context),
        ) {
            Ok(descriptions) => descriptions,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "planning failed; using the query as the only task");
                return vec![Task::new(1, query)];
            }
        };

        let tasks: Vec<Task> = descriptions
            .into_iter()
            .zip(1u32..)
            .map(|(description, id)| Task::new(id, description))
            .collect();
        info!(tasks = tasks.len(), "plan ready");
        tasks
    }
}
