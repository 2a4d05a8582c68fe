//! Scripted collaborators for exercising the loop without a real oracle,
//! real actions or a real terminal.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::types::{ActionArgs, ActionCall, ActionRecord, ActionSpec};
use crate::io::config::{DEFAULT_CONFIG_FILE, LoopConfig, write_config};
use crate::io::oracle::DecisionOracle;
use crate::io::registry::Action;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build action args from a JSON object literal.
pub fn args(value: Value) -> ActionArgs {
    match value {
        Value::Object(map) => map,
        other => panic!("action args must be a JSON object, got {other}"),
    }
}

/// Build an action call from a name and a JSON object literal.
pub fn call(name: &str, value: Value) -> ActionCall {
    ActionCall::new(name, args(value))
}

/// Per-operation call counts of a [`ScriptedOracle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OracleCalls {
    pub plan: usize,
    pub next_action: usize,
    pub is_done: usize,
    pub optimize_args: usize,
    pub synthesize: usize,
}

/// What `synthesize` was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub outputs: Vec<String>,
    pub partial: bool,
}

enum NextScript {
    Queue(VecDeque<Option<ActionCall>>),
    Cycle(Vec<ActionCall>, usize),
    Fail,
    Panic,
}

#[derive(Default)]
struct Recorded {
    calls: OracleCalls,
    plan_contexts: Vec<Option<String>>,
    histories: Vec<usize>,
    syntheses: Vec<SynthesisRequest>,
}

/// Oracle answering from a script.
///
/// Defaults: planning fails, no action is proposed, tasks are never done,
/// arguments pass through unchanged and the answer lists every output.
pub struct ScriptedOracle {
    plan: Option<Vec<String>>,
    next: Mutex<NextScript>,
    done: Mutex<VecDeque<bool>>,
    done_default: bool,
    optimized: Option<Option<ActionArgs>>,
    answer: Option<Option<String>>,
    recorded: Mutex<Recorded>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            plan: None,
            next: Mutex::new(NextScript::Queue(VecDeque::new())),
            done: Mutex::new(VecDeque::new()),
            done_default: false,
            optimized: None,
            answer: None,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn with_plan<S: Into<String>>(mut self, tasks: Vec<S>) -> Self {
        self.plan = Some(tasks.into_iter().map(Into::into).collect());
        self
    }

    pub fn failing_plan(mut self) -> Self {
        self.plan = None;
        self
    }

    /// Proposals handed out in order; `None` once the queue runs dry.
    pub fn with_actions(self, actions: Vec<Option<ActionCall>>) -> Self {
        *lock(&self.next) = NextScript::Queue(actions.into());
        self
    }

    /// Proposals repeated round-robin forever.
    pub fn cycle_actions(self, actions: Vec<ActionCall>) -> Self {
        *lock(&self.next) = NextScript::Cycle(actions, 0);
        self
    }

    pub fn always_propose(self, call: ActionCall) -> Self {
        self.cycle_actions(vec![call])
    }

    pub fn failing_next_action(self) -> Self {
        *lock(&self.next) = NextScript::Fail;
        self
    }

    pub fn panicking_next_action(self) -> Self {
        *lock(&self.next) = NextScript::Panic;
        self
    }

    /// Completion verdicts handed out in order, then `always_done`'s value.
    pub fn with_done(self, verdicts: Vec<bool>) -> Self {
        *lock(&self.done) = verdicts.into();
        self
    }

    pub fn always_done(mut self, done: bool) -> Self {
        self.done_default = done;
        self
    }

    pub fn with_optimized(mut self, refined: ActionArgs) -> Self {
        self.optimized = Some(Some(refined));
        self
    }

    pub fn failing_optimize(mut self) -> Self {
        self.optimized = Some(None);
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(Some(answer.into()));
        self
    }

    pub fn failing_synthesize(mut self) -> Self {
        self.answer = Some(None);
        self
    }

    pub fn calls(&self) -> OracleCalls {
        lock(&self.recorded).calls
    }

    pub fn plan_contexts(&self) -> Vec<Option<String>> {
        lock(&self.recorded).plan_contexts.clone()
    }

    /// History length seen by each `next_action` call.
    pub fn history_lengths(&self) -> Vec<usize> {
        lock(&self.recorded).histories.clone()
    }

    pub fn syntheses(&self) -> Vec<SynthesisRequest> {
        lock(&self.recorded).syntheses.clone()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn plan(
        &self,
        _query: &str,
        _actions: &[ActionSpec],
        context: Option<&str>,
    ) -> Result<Vec<String>> {
        {
            let mut recorded = lock(&self.recorded);
            recorded.calls.plan += 1;
            recorded.plan_contexts.push(context.map(str::to_string));
        }
        self.plan
            .clone()
            .ok_or_else(|| anyhow!("scripted plan failure"))
    }

    async fn next_action(
        &self,
        _task: &str,
        _actions: &[ActionSpec],
        history: &[ActionRecord],
    ) -> Result<Option<ActionCall>> {
        {
            let mut recorded = lock(&self.recorded);
            recorded.calls.next_action += 1;
            recorded.histories.push(history.len());
        }
        let mut script = lock(&self.next);
        match &mut *script {
            NextScript::Queue(queue) => Ok(queue.pop_front().flatten()),
            NextScript::Cycle(calls, cursor) => {
                if calls.is_empty() {
                    return Ok(None);
                }
                let next = calls[*cursor % calls.len()].clone();
                *cursor += 1;
                Ok(Some(next))
            }
            NextScript::Fail => Err(anyhow!("scripted next_action failure")),
            NextScript::Panic => panic!("scripted next_action panic"),
        }
    }

    async fn is_done(&self, _task: &str, _recent: &[ActionRecord]) -> Result<bool> {
        lock(&self.recorded).calls.is_done += 1;
        Ok(lock(&self.done).pop_front().unwrap_or(self.done_default))
    }

    async fn optimize_args(
        &self,
        _action: &str,
        args: &ActionArgs,
        _task: &str,
        _schema: &Value,
    ) -> Result<ActionArgs> {
        lock(&self.recorded).calls.optimize_args += 1;
        match &self.optimized {
            None => Ok(args.clone()),
            Some(Some(refined)) => Ok(refined.clone()),
            Some(None) => Err(anyhow!("scripted optimize failure")),
        }
    }

    async fn synthesize(
        &self,
        _query: &str,
        outputs: &[ActionRecord],
        partial: bool,
    ) -> Result<String> {
        let texts: Vec<String> = outputs.iter().map(|r| r.result.output_text()).collect();
        {
            let mut recorded = lock(&self.recorded);
            recorded.calls.synthesize += 1;
            recorded.syntheses.push(SynthesisRequest {
                outputs: texts.clone(),
                partial,
            });
        }
        match &self.answer {
            None if texts.is_empty() => Ok("Nothing to report.".to_string()),
            None => Ok(texts.join("\n")),
            Some(Some(answer)) => Ok(answer.clone()),
            Some(None) => Err(anyhow!("scripted synthesize failure")),
        }
    }
}

/// Action returning a fixed output and remembering its arguments.
pub struct StubAction {
    name: String,
    output: Value,
    schema: Value,
    calls: Mutex<Vec<ActionArgs>>,
}

impl StubAction {
    pub fn new(name: &str, output: Value) -> Self {
        Self {
            name: name.to_string(),
            output,
            schema: json!({ "type": "object" }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn calls(&self) -> Vec<ActionArgs> {
        lock(&self.calls).clone()
    }

    pub fn invocations(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Action for StubAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "stub action"
    }

    fn schema(&self) -> Value {
        self.schema.clone()
    }

    async fn invoke(&self, args: &ActionArgs) -> Result<Value> {
        lock(&self.calls).push(args.clone());
        Ok(self.output.clone())
    }
}

/// Action that always errors.
pub struct FailingAction {
    name: String,
    message: String,
    invocations: Mutex<usize>,
}

impl FailingAction {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            invocations: Mutex::new(0),
        }
    }

    pub fn invocations(&self) -> usize {
        *lock(&self.invocations)
    }
}

#[async_trait]
impl Action for FailingAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn invoke(&self, _args: &ActionArgs) -> Result<Value> {
        *lock(&self.invocations) += 1;
        Err(anyhow!("{}", self.message))
    }
}

/// Action that panics when invoked.
pub struct PanickingAction {
    name: String,
}

impl PanickingAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Action for PanickingAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "panics"
    }

    fn schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn invoke(&self, _args: &ActionArgs) -> Result<Value> {
        panic!("action {} blew up", self.name)
    }
}

/// In-memory writer whose clones share one buffer.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.bytes).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Temporary directory holding a config file and run records.
pub struct TestWorkspace {
    temp: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join(DEFAULT_CONFIG_FILE)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.path().join("records")
    }

    pub fn write_config(&self, config: &LoopConfig) -> Result<PathBuf> {
        let path = self.config_path();
        write_config(&path, config)?;
        Ok(path)
    }
}
