//! The bounded, oracle-guided execution loop.
//!
//! A run moves through these states:
//!
//! ```text
//! SelectingTask -> AskingAction -> (no action)  -> task done -> SelectingTask
//!                               -> (action)     -> Optimizing -> Executing
//!                                                  -> RecordOutput -> ValidatingDone
//! Synthesizing (terminal)
//! ```
//!
//! Oracle failures degrade to safe defaults, action failures become failed
//! results, and anything that still escapes is caught by the outer boundary
//! in [`LoopRunner::run_outcome`]. A run therefore always yields an
//! [`Answer`].

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::StepBudget;
use crate::core::repetition::{RepetitionGuard, signature};
use crate::core::selector::{first_open_task, mark_done};
use crate::core::types::{ActionCall, ActionRecord, ActionResult, ActionSpec, Answer, StopReason, Task};
use crate::io::bridge::{Bridge, panic_message};
use crate::io::config::LoopConfig;
use crate::io::memory::{MemoryStore, NoopMemory};
use crate::io::oracle::DecisionOracle;
use crate::io::progress::{Phase, ProgressReporter};
use crate::io::registry::ActionRegistry;
use crate::io::run_record::{RunRecord, new_run_id, write_run_record};
use crate::optimizer::ArgumentOptimizer;
use crate::planner::TaskPlanner;

pub const DEFAULT_SESSION: &str = "default";

/// Everything a caller may want to know about a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub answer: Answer,
    pub stop: StopReason,
    pub tasks: Vec<Task>,
    /// Every executed step, in order.
    pub session_log: Vec<ActionRecord>,
    /// Executed steps grouped by task id.
    pub task_logs: BTreeMap<u32, Vec<ActionRecord>>,
    pub budget: StepBudget,
    pub record_path: Option<PathBuf>,
}

/// Mutable state of one run. Lives outside the unwind boundary so a fatal
/// run can still report what it got done.
struct RunState {
    tasks: Vec<Task>,
    session_log: Vec<ActionRecord>,
    task_logs: BTreeMap<u32, Vec<ActionRecord>>,
    budget: StepBudget,
    guard: RepetitionGuard,
}

impl RunState {
    fn new(budget: StepBudget) -> Self {
        Self {
            tasks: Vec::new(),
            session_log: Vec::new(),
            task_logs: BTreeMap::new(),
            budget,
            guard: RepetitionGuard::new(),
        }
    }

    fn record(&mut self, record: ActionRecord) {
        self.task_logs
            .entry(record.task_id)
            .or_default()
            .push(record.clone());
        self.session_log.push(record);
    }
}

/// Drives queries through plan, act and synthesis with one oracle and one
/// action registry.
pub struct LoopRunner {
    config: LoopConfig,
    oracle: Arc<dyn DecisionOracle>,
    registry: ActionRegistry,
    memory: Arc<dyn MemoryStore>,
    progress: ProgressReporter,
    session_id: String,
    bridge: Bridge,
}

impl LoopRunner {
    pub fn new(
        config: LoopConfig,
        oracle: Arc<dyn DecisionOracle>,
        registry: ActionRegistry,
    ) -> Result<Self> {
        let progress = if config.progress {
            ProgressReporter::new()
        } else {
            ProgressReporter::disabled()
        };
        Ok(Self {
            config,
            oracle,
            registry,
            memory: Arc::new(NoopMemory),
            progress,
            session_id: DEFAULT_SESSION.to_string(),
            bridge: Bridge::new()?,
        })
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Answer `query`. Never fails.
    pub fn run(&self, query: &str) -> Answer {
        self.run_outcome(query).answer
    }

    /// Answer `query` and report how the run went.
    #[instrument(skip_all, fields(session = %self.session_id))]
    pub fn run_outcome(&self, query: &str) -> RunOutcome {
        let run_id = new_run_id();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(run_id = %run_id, "run started");

        let budget = StepBudget::new(self.config.max_global_steps, self.config.max_steps_per_task);
        let mut state = RunState::new(budget);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.execute(query, &mut state)))
            .unwrap_or_else(|panic| Err(anyhow!("panic: {}", panic_message(&*panic))));
        let (answer, stop) = match result {
            Ok(done) => done,
            Err(err) => {
                error!(err = %format!("{err:#}"), "run failed");
                self.progress.close();
                let answer = Answer {
                    text: format!("The run failed: {err:#}"),
                    partial: false,
                };
                (answer, StopReason::Fatal)
            }
        };

        if let Err(err) = self.memory.append(
            &self.session_id,
            &format!("Q: {query}\nA: {}", answer.text),
        ) {
            warn!(err = %format!("{err:#}"), "memory append failed");
        }

        let record_path = self.config.record_dir.as_ref().and_then(|dir| {
            let finished_at = Utc::now();
            let record = RunRecord {
                run_id: run_id.clone(),
                session_id: Some(self.session_id.clone()),
                query: query.to_string(),
                started_at,
                finished_at,
                duration_ms: i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX),
                tasks: state.tasks.clone(),
                session_log: state.session_log.clone(),
                stop,
                steps: state.budget.global_count(),
                answer: answer.clone(),
            };
            match write_run_record(dir, &record) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "failed to write run record");
                    None
                }
            }
        });

        info!(
            run_id = %run_id,
            stop = stop.as_str(),
            steps = state.budget.global_count(),
            "run finished"
        );
        RunOutcome {
            run_id,
            answer,
            stop,
            tasks: state.tasks,
            session_log: state.session_log,
            task_logs: state.task_logs,
            budget: state.budget,
            record_path,
        }
    }

    fn execute(&self, query: &str, state: &mut RunState) -> Result<(Answer, StopReason)> {
        let specs = self.registry.specs();
        let context = self.prior_context(query);

        let phase = self
            .progress
            .start_phase(Phase::Planning, "Breaking down the request", "");
        state.tasks = TaskPlanner::new(self.oracle.as_ref(), &self.bridge, self.config.oracle_timeout())
            .plan(query, &specs, context.as_deref());
        self.progress.complete_phase(phase, "", false);

        let stop = self.work_tasks(state, &specs)?;
        let answer = self.synthesize(query, &state.session_log, stop.is_partial());
        Ok((answer, stop))
    }

    fn prior_context(&self, query: &str) -> Option<String> {
        if self.config.memory_limit == 0 {
            return None;
        }
        match self
            .memory
            .retrieve(&self.session_id, query, self.config.memory_limit)
        {
            Ok(entries) if entries.is_empty() => None,
            Ok(entries) => Some(entries.join("\n\n")),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "memory retrieval failed");
                None
            }
        }
    }

    /// Run the task states until every task is done or the run must stop.
    fn work_tasks(&self, state: &mut RunState, specs: &[ActionSpec]) -> Result<StopReason> {
        let total = state.tasks.len();
        let optimizer =
            ArgumentOptimizer::new(self.oracle.as_ref(), &self.bridge, self.config.oracle_timeout());

        'select: loop {
            if state.budget.global_exhausted() {
                return Ok(StopReason::BudgetExhausted);
            }
            let Some(index) = first_open_task(&state.tasks) else {
                return Ok(StopReason::Completed);
            };
            state.budget.reset_per_task();
            let task = state
                .tasks
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow!("selected task {index} out of range"))?;
            debug!(task_id = task.id, "task selected");
            let label = format!("Task {}/{}", task.id, total);

            loop {
                let Some(call) = self.ask_next_action(&task, &label, specs, state) else {
                    debug!(task_id = task.id, "no further action; task done");
                    mark_done(&mut state.tasks, index);
                    continue 'select;
                };

                let call = self.optimize(&optimizer, &task, call);
                let result = self.invoke(&call);
                let sig = signature(&call);
                state.record(ActionRecord {
                    task_id: task.id,
                    call,
                    result,
                });
                if !state.budget.try_consume() {
                    return Ok(StopReason::BudgetExhausted);
                }

                // Checked on executed calls, so the fourth identical call runs
                // and a fifth is never made.
                if state.guard.observe(sig) {
                    warn!(task_id = task.id, "same action repeated; stopping run");
                    return Ok(StopReason::RepetitionDetected);
                }
                if state.budget.global_exhausted() {
                    info!(steps = state.budget.global_count(), "step budget exhausted");
                    return Ok(StopReason::BudgetExhausted);
                }

                if self.validate_done(&task, &label, state) {
                    mark_done(&mut state.tasks, index);
                    continue 'select;
                }
                if state.budget.per_task_exhausted() {
                    warn!(task_id = task.id, "per-task step budget exhausted; moving on");
                    continue 'select;
                }
            }
        }
    }

    fn ask_next_action(
        &self,
        task: &Task,
        label: &str,
        specs: &[ActionSpec],
        state: &RunState,
    ) -> Option<ActionCall> {
        let history = state.task_logs.get(&task.id).map(Vec::as_slice).unwrap_or(&[]);
        let phase = self
            .progress
            .start_phase(Phase::Thinking, label, task.description.as_str());
        let next = match self.bridge.call(
            "next_action",
            self.config.oracle_timeout(),
            self.oracle.next_action(&task.description, specs, history),
        ) {
            Ok(next) => next,
            Err(err) => {
                warn!(err = %format!("{err:#}"), task_id = task.id, "next action failed; treating task as done");
                None
            }
        };
        self.progress.complete_phase(phase, "", false);
        next
    }

    /// Unknown actions have no schema to optimize against and pass through.
    fn optimize(&self, optimizer: &ArgumentOptimizer<'_>, task: &Task, call: ActionCall) -> ActionCall {
        let Some(action) = self.registry.lookup(&call.name) else {
            return call;
        };
        let phase = self
            .progress
            .start_phase(Phase::Optimizing, call.name.as_str(), "refining arguments");
        let args = optimizer.optimize(&call.name, &call.args, &task.description, &action.schema());
        self.progress.complete_phase(phase, "", false);
        ActionCall { args, ..call }
    }

    /// Invoke one action. Every failure, including a panic inside the action,
    /// becomes a failed result.
    fn invoke(&self, call: &ActionCall) -> ActionResult {
        let Some(action) = self.registry.lookup(&call.name) else {
            warn!(action = %call.name, "unknown action");
            return ActionResult::failed(format!("unknown action '{}'", call.name));
        };
        let phase = self
            .progress
            .start_phase(Phase::Executing, call.name.as_str(), "");
        let result = match self.bridge.call(
            &call.name,
            self.config.action_timeout(),
            action.invoke(&call.args),
        ) {
            Ok(output) => ActionResult::ok(output),
            Err(err) => {
                warn!(action = %call.name, err = %format!("{err:#}"), "action failed");
                ActionResult::failed(format!("{err:#}"))
            }
        };
        self.progress.complete_phase(phase, "", false);
        result
    }

    fn validate_done(&self, task: &Task, label: &str, state: &RunState) -> bool {
        let recent = state.task_logs.get(&task.id).map(Vec::as_slice).unwrap_or(&[]);
        let phase = self
            .progress
            .start_phase(Phase::Validating, label, "checking results");
        let done = match self.bridge.call(
            "is_done",
            self.config.oracle_timeout(),
            self.oracle.is_done(&task.description, recent),
        ) {
            Ok(done) => done,
            Err(err) => {
                warn!(err = %format!("{err:#}"), task_id = task.id, "completion check failed; assuming not done");
                false
            }
        };
        self.progress.complete_phase(phase, "", false);
        done
    }

    fn synthesize(&self, query: &str, outputs: &[ActionRecord], partial: bool) -> Answer {
        let phase = self
            .progress
            .start_phase(Phase::Generating, "Writing the answer", "");
        let text = match self.bridge.call(
            "synthesize",
            self.config.oracle_timeout(),
            self.oracle.synthesize(query, outputs, partial),
        ) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("oracle returned an empty answer; using raw outputs");
                fallback_answer(outputs)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "synthesis failed; using raw outputs");
                fallback_answer(outputs)
            }
        };
        let done = if partial { "Partial answer ready" } else { "Answer ready" };
        self.progress.complete_phase(phase, done, true);
        Answer { text, partial }
    }
}

/// Raw concatenation of every output, or a short note when there are none.
pub fn fallback_answer(outputs: &[ActionRecord]) -> String {
    if outputs.is_empty() {
        return "No results were gathered for this request.".to_string();
    }
    outputs
        .iter()
        .map(ActionRecord::summary)
        .collect::<Vec<_>>()
        .join("\n")
}
