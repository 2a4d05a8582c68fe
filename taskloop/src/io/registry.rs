//! Action registry: name -> callable with a uniform call/result contract.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::{ActionArgs, ActionSpec};
use crate::io::config::ActionConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// A named, schema-described external operation.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted arguments.
    fn schema(&self) -> Value;

    /// Run the action. The output is either a JSON string or structured JSON.
    async fn invoke(&self, args: &ActionArgs) -> Result<Value>;
}

/// Registry of available actions, iterated in name order.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action, replacing any previous one with the same name.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        let name = action.name().to_string();
        if self.actions.insert(name.clone(), action).is_some() {
            debug!(action = %name, "replaced registered action");
        }
    }

    pub fn with(mut self, action: Arc<dyn Action>) -> Self {
        self.register(action);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Descriptions handed to the oracle.
    pub fn specs(&self) -> Vec<ActionSpec> {
        self.actions
            .values()
            .map(|action| ActionSpec {
                name: action.name().to_string(),
                description: action.description().to_string(),
                parameters: action.schema(),
            })
            .collect()
    }

    /// Build a registry of command actions from config.
    pub fn from_config(actions: &[ActionConfig], timeout: Duration, output_limit: usize) -> Self {
        let mut registry = Self::new();
        for action in actions {
            registry.register(Arc::new(CommandAction::new(
                action.clone(),
                timeout,
                output_limit,
            )));
        }
        registry
    }
}

/// Action that spawns a configured command with the JSON arguments on stdin.
///
/// Stdout becomes the output: parsed as JSON when it is valid JSON, else kept
/// as a trimmed string. A non-zero exit or timeout is an error.
pub struct CommandAction {
    config: ActionConfig,
    timeout: Duration,
    output_limit: usize,
}

impl CommandAction {
    pub fn new(config: ActionConfig, timeout: Duration, output_limit: usize) -> Self {
        Self {
            config,
            timeout,
            output_limit,
        }
    }
}

#[async_trait]
impl Action for CommandAction {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn schema(&self) -> Value {
        self.config.parameters.clone()
    }

    #[instrument(skip_all, fields(action = %self.config.name))]
    async fn invoke(&self, args: &ActionArgs) -> Result<Value> {
        let argv = self.config.command.clone();
        let payload = serde_json::to_vec(args).context("serialize action args")?;
        let timeout = self.timeout;
        let limit = self.output_limit;
        let label = format!("action '{}'", self.config.name);

        let output = tokio::task::spawn_blocking(move || {
            let cmd = command_from_argv(&argv)?;
            run_command_with_timeout(cmd, Some(&payload), timeout, limit)?.into_success(&label)
        })
        .await
        .map_err(|err| anyhow!("action worker failed: {err}"))??;

        let stdout = output.stdout_text();
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bridge::Bridge;
    use serde_json::json;

    fn command_action(name: &str, script: &str) -> CommandAction {
        CommandAction::new(
            ActionConfig {
                name: name.to_string(),
                description: format!("{name} description"),
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                parameters: json!({ "type": "object" }),
            },
            Duration::from_secs(5),
            10_000,
        )
    }

    #[test]
    fn specs_are_sorted_by_name() {
        let registry = ActionRegistry::new()
            .with(Arc::new(command_action("zeta", "true")))
            .with(Arc::new(command_action("alpha", "true")));
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(registry.lookup("alpha").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn command_action_echoes_json_arguments() {
        let bridge = Bridge::new().expect("bridge");
        let action = command_action("echo", "cat");
        let mut args = ActionArgs::new();
        args.insert("symbol".to_string(), json!("SOL"));

        let output = bridge
            .call("echo", Duration::from_secs(5), action.invoke(&args))
            .expect("invoke");
        assert_eq!(output, json!({ "symbol": "SOL" }));
    }

    #[cfg(unix)]
    #[test]
    fn command_action_keeps_plain_text_and_reports_failures() {
        let bridge = Bridge::new().expect("bridge");
        let args = ActionArgs::new();

        let text = command_action("hello", "echo hello world");
        let output = bridge
            .call("hello", Duration::from_secs(5), text.invoke(&args))
            .expect("invoke");
        assert_eq!(output, json!("hello world"));

        let failing = command_action("broken", "echo bad input >&2; exit 2");
        let err = bridge
            .call("broken", Duration::from_secs(5), failing.invoke(&args))
            .unwrap_err();
        assert!(err.to_string().contains("bad input"));
    }
}
