//! Decision oracle backed by an external command.
//!
//! Each operation renders a prompt, pipes it to the configured command on
//! stdin and expects one JSON object on stdout. The reply is validated against
//! the operation's embedded schema before it is deserialized, so a malformed
//! reply is an ordinary oracle failure the loop already knows how to degrade.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::{ActionArgs, ActionCall, ActionRecord, ActionSpec};
use crate::io::config::OracleConfig;
use crate::io::oracle::DecisionOracle;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::prompt::PromptEngine;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan_reply.schema.json");
const NEXT_ACTION_SCHEMA: &str = include_str!("../../schemas/next_action_reply.schema.json");
const IS_DONE_SCHEMA: &str = include_str!("../../schemas/is_done_reply.schema.json");
const OPTIMIZE_ARGS_SCHEMA: &str = include_str!("../../schemas/optimize_args_reply.schema.json");
const SYNTHESIZE_SCHEMA: &str = include_str!("../../schemas/synthesize_reply.schema.json");

#[derive(Debug, Deserialize)]
struct PlanReply {
    tasks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NextActionReply {
    action: Option<ActionCall>,
}

#[derive(Debug, Deserialize)]
struct IsDoneReply {
    done: bool,
}

#[derive(Debug, Deserialize)]
struct OptimizeArgsReply {
    args: ActionArgs,
}

#[derive(Debug, Deserialize)]
struct SynthesizeReply {
    answer: String,
}

struct ReplySchemas {
    plan: Validator,
    next_action: Validator,
    is_done: Validator,
    optimize_args: Validator,
    synthesize: Validator,
}

impl ReplySchemas {
    fn compile() -> Result<Self> {
        Ok(Self {
            plan: compile_schema("plan", PLAN_SCHEMA)?,
            next_action: compile_schema("next_action", NEXT_ACTION_SCHEMA)?,
            is_done: compile_schema("is_done", IS_DONE_SCHEMA)?,
            optimize_args: compile_schema("optimize_args", OPTIMIZE_ARGS_SCHEMA)?,
            synthesize: compile_schema("synthesize", SYNTHESIZE_SCHEMA)?,
        })
    }
}

fn compile_schema(name: &str, raw: &str) -> Result<Validator> {
    let schema: Value =
        serde_json::from_str(raw).with_context(|| format!("parse {name} reply schema"))?;
    validator_for(&schema).map_err(|err| anyhow!("invalid {name} reply schema: {err}"))
}

/// Oracle that shells out to a command (for example a model CLI) per decision.
pub struct CommandOracle {
    command: Vec<String>,
    timeout: Duration,
    output_limit: usize,
    prompts: PromptEngine,
    schemas: ReplySchemas,
    fence: Regex,
}

impl CommandOracle {
    pub fn new(config: &OracleConfig, timeout: Duration, output_limit: usize) -> Result<Self> {
        if config.command.is_empty() {
            bail!("oracle command is empty");
        }
        Ok(Self {
            command: config.command.clone(),
            timeout,
            output_limit,
            prompts: PromptEngine::new()?,
            schemas: ReplySchemas::compile()?,
            fence: Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").context("compile fence regex")?,
        })
    }

    async fn ask<T: DeserializeOwned>(
        &self,
        operation: &str,
        schema: &Validator,
        prompt: String,
    ) -> Result<T> {
        let argv = self.command.clone();
        let timeout = self.timeout;
        let limit = self.output_limit;
        let label = format!("oracle {operation}");

        let output = tokio::task::spawn_blocking(move || {
            let cmd = command_from_argv(&argv)?;
            run_command_with_timeout(cmd, Some(prompt.as_bytes()), timeout, limit)?
                .into_success(&label)
        })
        .await
        .map_err(|err| anyhow!("oracle worker failed: {err}"))??;

        let reply = self
            .extract_json(&output.stdout_text())
            .with_context(|| format!("oracle {operation} reply"))?;
        validate_reply(operation, schema, &reply)?;
        debug!(operation, "oracle reply accepted");
        serde_json::from_value(reply).with_context(|| format!("deserialize {operation} reply"))
    }

    /// Accept a bare JSON object, a fenced ```json block, or the outermost
    /// `{...}` span of chatty output, in that order.
    fn extract_json(&self, stdout: &str) -> Result<Value> {
        let trimmed = stdout.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Ok(value);
        }
        if let Some(block) = self.fence.captures(trimmed).and_then(|caps| caps.get(1))
            && let Ok(value) = serde_json::from_str::<Value>(block.as_str())
        {
            return Ok(value);
        }
        if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
            && start < end
        {
            return serde_json::from_str(&trimmed[start..=end]).context("parse embedded json");
        }
        bail!("no JSON object in output")
    }
}

fn validate_reply(operation: &str, schema: &Validator, reply: &Value) -> Result<()> {
    if schema.is_valid(reply) {
        return Ok(());
    }
    let messages: Vec<String> = schema.iter_errors(reply).map(|err| err.to_string()).collect();
    bail!("oracle {operation} reply failed schema: {}", messages.join("; "))
}

#[async_trait]
impl DecisionOracle for CommandOracle {
    #[instrument(skip_all)]
    async fn plan(
        &self,
        query: &str,
        actions: &[ActionSpec],
        context: Option<&str>,
    ) -> Result<Vec<String>> {
        let prompt = self.prompts.render_plan(query, actions, context)?;
        let reply: PlanReply = self.ask("plan", &self.schemas.plan, prompt).await?;
        Ok(reply.tasks)
    }

    #[instrument(skip_all)]
    async fn next_action(
        &self,
        task: &str,
        actions: &[ActionSpec],
        history: &[ActionRecord],
    ) -> Result<Option<ActionCall>> {
        let prompt = self.prompts.render_next_action(task, actions, history)?;
        let reply: NextActionReply = self
            .ask("next_action", &self.schemas.next_action, prompt)
            .await?;
        Ok(reply.action)
    }

    #[instrument(skip_all)]
    async fn is_done(&self, task: &str, recent: &[ActionRecord]) -> Result<bool> {
        let prompt = self.prompts.render_is_done(task, recent)?;
        let reply: IsDoneReply = self.ask("is_done", &self.schemas.is_done, prompt).await?;
        Ok(reply.done)
    }

    #[instrument(skip_all, fields(action = %action))]
    async fn optimize_args(
        &self,
        action: &str,
        args: &ActionArgs,
        task: &str,
        schema: &Value,
    ) -> Result<ActionArgs> {
        let prompt = self
            .prompts
            .render_optimize_args(action, args, task, schema)?;
        let reply: OptimizeArgsReply = self
            .ask("optimize_args", &self.schemas.optimize_args, prompt)
            .await?;
        Ok(reply.args)
    }

    #[instrument(skip_all, fields(partial = partial))]
    async fn synthesize(
        &self,
        query: &str,
        outputs: &[ActionRecord],
        partial: bool,
    ) -> Result<String> {
        let prompt = self.prompts.render_synthesize(query, outputs, partial)?;
        let reply: SynthesizeReply = self
            .ask("synthesize", &self.schemas.synthesize, prompt)
            .await?;
        Ok(reply.answer)
    }
}
