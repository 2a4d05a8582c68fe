//! Prompt rendering for the command oracle.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;

use crate::core::types::{ActionArgs, ActionRecord, ActionSpec};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const NEXT_ACTION_TEMPLATE: &str = include_str!("prompts/next_action.md");
const IS_DONE_TEMPLATE: &str = include_str!("prompts/is_done.md");
const OPTIMIZE_ARGS_TEMPLATE: &str = include_str!("prompts/optimize_args.md");
const SYNTHESIZE_TEMPLATE: &str = include_str!("prompts/synthesize.md");

/// Action outputs longer than this are cut in prompts.
pub const OUTPUT_EXCERPT_CHARS: usize = 2_000;

#[derive(Debug, Serialize)]
struct ActionView {
    name: String,
    description: String,
    parameters: String,
}

impl ActionView {
    fn from_spec(spec: &ActionSpec) -> Self {
        Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            parameters: spec.parameters.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordView {
    name: String,
    args: String,
    success: bool,
    output: String,
    error: String,
}

impl RecordView {
    fn from_record(record: &ActionRecord) -> Self {
        Self {
            name: record.call.name.clone(),
            args: Value::Object(record.call.args.clone()).to_string(),
            success: record.result.success,
            output: excerpt(&record.result.output_text()),
            error: record.result.error.clone().unwrap_or_default(),
        }
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= OUTPUT_EXCERPT_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(OUTPUT_EXCERPT_CHARS).collect();
    cut.push_str(" …");
    cut
}

fn views(records: &[ActionRecord]) -> Vec<RecordView> {
    records.iter().map(RecordView::from_record).collect()
}

/// minijinja environment holding the embedded templates.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("plan", PLAN_TEMPLATE),
            ("next_action", NEXT_ACTION_TEMPLATE),
            ("is_done", IS_DONE_TEMPLATE),
            ("optimize_args", OPTIMIZE_ARGS_TEMPLATE),
            ("synthesize", SYNTHESIZE_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} template"))?;
        }
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))
    }

    pub fn render_plan(
        &self,
        query: &str,
        actions: &[ActionSpec],
        prior_context: Option<&str>,
    ) -> Result<String> {
        let actions: Vec<ActionView> = actions.iter().map(ActionView::from_spec).collect();
        self.render(
            "plan",
            context! {
                query => query.trim(),
                actions => actions,
                context => prior_context.map(str::trim).filter(|s| !s.is_empty()),
            },
        )
    }

    pub fn render_next_action(
        &self,
        task: &str,
        actions: &[ActionSpec],
        history: &[ActionRecord],
    ) -> Result<String> {
        let actions: Vec<ActionView> = actions.iter().map(ActionView::from_spec).collect();
        self.render(
            "next_action",
            context! {
                task => task.trim(),
                actions => actions,
                history => views(history),
            },
        )
    }

    pub fn render_is_done(&self, task: &str, recent: &[ActionRecord]) -> Result<String> {
        self.render(
            "is_done",
            context! {
                task => task.trim(),
                recent => views(recent),
            },
        )
    }

    pub fn render_optimize_args(
        &self,
        action: &str,
        args: &ActionArgs,
        task: &str,
        schema: &Value,
    ) -> Result<String> {
        self.render(
            "optimize_args",
            context! {
                action => action,
                task => task.trim(),
                schema => serde_json::to_string_pretty(schema)?,
                args => serde_json::to_string_pretty(args)?,
            },
        )
    }

    pub fn render_synthesize(
        &self,
        query: &str,
        outputs: &[ActionRecord],
        partial: bool,
    ) -> Result<String> {
        self.render(
            "synthesize",
            context! {
                query => query.trim(),
                outputs => views(outputs),
                partial => partial,
            },
        )
    }
}
