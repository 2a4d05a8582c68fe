//! End-to-end loop scenarios driven by scripted collaborators.
//!
//! Each test wires a `ScriptedOracle` and stub actions into a `LoopRunner`
//! and checks how the run ends: which actions ran, what was logged, how much
//! budget was used and whether the answer is partial.

use std::fs;
use std::sync::Arc;

use serde_json::{Value, json};

use taskloop::core::types::StopReason;
use taskloop::io::config::LoopConfig;
use taskloop::io::memory::{InMemoryStore, MemoryStore};
use taskloop::io::progress::{Phase, ProgressReporter};
use taskloop::io::registry::ActionRegistry;
use taskloop::looping::LoopRunner;
use taskloop::test_support::{
    FailingAction, PanickingAction, ScriptedOracle, SharedBuffer, StubAction, TestWorkspace, call,
};

fn quiet_config() -> LoopConfig {
    LoopConfig {
        progress: false,
        ..LoopConfig::default()
    }
}

fn runner(config: LoopConfig, oracle: &Arc<ScriptedOracle>, registry: ActionRegistry) -> LoopRunner {
    LoopRunner::new(config, oracle.clone(), registry).expect("runner")
}

/// The same proposal four times in a row stops the run: the action runs four
/// times, a fifth call is never made, and the answer is partial.
#[test]
fn identical_proposals_trip_after_four_invocations() {
    let lookup = Arc::new(StubAction::new("lookup", json!("142")));
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["get SOL price"])
            .always_propose(call("lookup", json!({ "symbol": "SOL", "currency": "USD" })))
            .always_done(false),
    );
    let config = LoopConfig {
        max_steps_per_task: 10,
        ..quiet_config()
    };

    let outcome = runner(config, &oracle, ActionRegistry::new().with(lookup.clone()))
        .run_outcome("price of SOL");

    assert_eq!(lookup.invocations(), 4);
    assert_eq!(oracle.calls().next_action, 4);
    assert_eq!(oracle.history_lengths(), vec![0, 1, 2, 3]);
    assert_eq!(outcome.stop, StopReason::RepetitionDetected);
    assert!(outcome.answer.partial);
    assert_eq!(oracle.syntheses().last().map(|s| s.partial), Some(true));
}

/// Key order of arguments does not hide a repetition.
#[test]
fn reordered_arguments_still_count_as_repetition() {
    let lookup = Arc::new(StubAction::new("lookup", json!("142")));
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["get SOL price"])
            .cycle_actions(vec![
                call("lookup", json!({ "symbol": "SOL", "currency": "USD" })),
                call("lookup", json!({ "currency": "USD", "symbol": "SOL" })),
            ])
            .always_done(false),
    );
    let config = LoopConfig {
        max_steps_per_task: 10,
        ..quiet_config()
    };

    let outcome = runner(config, &oracle, ActionRegistry::new().with(lookup.clone()))
        .run_outcome("price of SOL");

    assert_eq!(lookup.invocations(), 4);
    assert_eq!(outcome.stop, StopReason::RepetitionDetected);
}

/// A failing action is recorded and counted but does not abort its task.
#[test]
fn failing_action_is_logged_and_counted() {
    let failing = Arc::new(FailingAction::new("quote", "upstream returned 503"));
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["fetch quote"])
            .with_actions(vec![Some(call("quote", json!({ "symbol": "SOL" })))])
            .always_done(true),
    );

    let outcome = runner(quiet_config(), &oracle, ActionRegistry::new().with(failing.clone()))
        .run_outcome("quote SOL");

    assert_eq!(failing.invocations(), 1);
    let log = &outcome.task_logs[&1];
    assert_eq!(log.len(), 1);
    assert!(!log[0].result.success);
    assert!(
        log[0]
            .result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("upstream returned 503"))
    );
    assert_eq!(outcome.budget.per_task_count(), 1);
    assert_eq!(outcome.budget.global_count(), 1);
    // The task still went through validation and completed.
    assert_eq!(oracle.calls().is_done, 1);
    assert!(outcome.tasks[0].done);
    assert_eq!(outcome.stop, StopReason::Completed);
}

/// A panic inside an action becomes a failed result like any other error.
#[test]
fn panicking_action_is_contained() {
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["explode"])
            .with_actions(vec![Some(call("boom", json!({})))])
            .always_done(true),
    );
    let registry = ActionRegistry::new().with(Arc::new(PanickingAction::new("boom")));

    let outcome = runner(quiet_config(), &oracle, registry).run_outcome("q");

    assert_eq!(outcome.session_log.len(), 1);
    let result = &outcome.session_log[0].result;
    assert!(!result.success);
    assert!(result.error.as_deref().is_some_and(|e| e.contains("blew up")));
    assert_eq!(outcome.stop, StopReason::Completed);
}

/// Two tasks, one action each, both immediately done.
#[test]
fn two_tasks_complete_with_both_outputs_in_answer() {
    let first = Arc::new(StubAction::new("first", json!("OUT1")));
    let second = Arc::new(StubAction::new("second", json!("OUT2")));
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["task one", "task two"])
            .with_actions(vec![
                Some(call("first", json!({}))),
                Some(call("second", json!({}))),
            ])
            .always_done(true),
    );
    let registry = ActionRegistry::new().with(first).with(second);

    let outcome = runner(quiet_config(), &oracle, registry).run_outcome("do both");

    assert_eq!(outcome.session_log.len(), 2);
    assert!(outcome.answer.text.contains("OUT1"));
    assert!(outcome.answer.text.contains("OUT2"));
    assert!(!outcome.answer.partial);
    assert_eq!(outcome.stop, StopReason::Completed);
    assert!(outcome.tasks.iter().all(|t| t.done));
    assert_eq!(outcome.task_logs[&1][0].call.name, "first");
    assert_eq!(outcome.task_logs[&2][0].call.name, "second");
}

/// With a global budget of one, exactly one action runs and the answer is
/// partial but built from that output.
#[test]
fn single_step_budget_yields_partial_answer() {
    let lookup = Arc::new(StubAction::new("lookup", json!("ONLY")));
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["a", "b"])
            .cycle_actions(vec![
                call("lookup", json!({ "n": 1 })),
                call("lookup", json!({ "n": 2 })),
            ])
            .always_done(false),
    );
    let config = LoopConfig {
        max_global_steps: 1,
        ..quiet_config()
    };

    let outcome = runner(config, &oracle, ActionRegistry::new().with(lookup.clone()))
        .run_outcome("q");

    assert_eq!(lookup.invocations(), 1);
    assert_eq!(outcome.session_log.len(), 1);
    assert_eq!(outcome.stop, StopReason::BudgetExhausted);
    assert!(outcome.answer.partial);
    assert!(outcome.answer.text.contains("ONLY"));
    // The budget ran out before validation.
    assert_eq!(oracle.calls().is_done, 0);
}

/// A successful empty plan skips straight to synthesis.
#[test]
fn empty_plan_synthesizes_without_outputs() {
    let lookup = Arc::new(StubAction::new("lookup", json!("unused")));
    let oracle = Arc::new(ScriptedOracle::new().with_plan(Vec::<String>::new()));

    let outcome = runner(quiet_config(), &oracle, ActionRegistry::new().with(lookup.clone()))
        .run_outcome("write me a poem");

    assert_eq!(lookup.invocations(), 0);
    assert_eq!(oracle.calls().next_action, 0);
    assert_eq!(oracle.calls().synthesize, 1);
    assert_eq!(
        oracle.syntheses()[0],
        taskloop::test_support::SynthesisRequest {
            outputs: Vec::new(),
            partial: false,
        }
    );
    assert!(!outcome.answer.text.trim().is_empty());
    assert!(!outcome.answer.partial);
}

/// Planning failure runs the whole query as one task.
#[test]
fn failed_plan_runs_query_as_single_task() {
    let oracle = Arc::new(ScriptedOracle::new().failing_plan());

    let outcome = runner(quiet_config(), &oracle, ActionRegistry::new()).run_outcome("price of SOL");

    assert_eq!(outcome.tasks.len(), 1);
    assert_eq!(outcome.tasks[0].description, "price of SOL");
    // No action proposed: the task is considered done.
    assert!(outcome.tasks[0].done);
    assert_eq!(outcome.stop, StopReason::Completed);
}

/// Oracle failures and panics while choosing actions end the task, not the run.
#[test]
fn next_action_failure_or_panic_marks_task_done() {
    for oracle in [
        ScriptedOracle::new().with_plan(vec!["a", "b"]).failing_next_action(),
        ScriptedOracle::new().with_plan(vec!["a", "b"]).panicking_next_action(),
    ] {
        let oracle = Arc::new(oracle);
        let outcome = runner(quiet_config(), &oracle, ActionRegistry::new()).run_outcome("q");
        assert_eq!(oracle.calls().next_action, 2);
        assert!(outcome.tasks.iter().all(|t| t.done));
        assert_eq!(outcome.stop, StopReason::Completed);
        assert!(!outcome.answer.text.is_empty());
    }
}

/// Global count never decreases and never exceeds its cap, whatever the plan.
#[test]
fn global_budget_is_monotonic_and_capped() {
    for max_global in 1..=6 {
        let lookup = Arc::new(StubAction::new("lookup", json!("x")));
        let oracle = Arc::new(
            ScriptedOracle::new()
                .with_plan(vec!["a", "b", "c"])
                .cycle_actions(vec![
                    call("lookup", json!({ "n": 1 })),
                    call("lookup", json!({ "n": 2 })),
                    call("lookup", json!({ "n": 3 })),
                ])
                .with_done(vec![false, true, false, false, true]),
        );
        let config = LoopConfig {
            max_global_steps: max_global,
            max_steps_per_task: 2,
            ..quiet_config()
        };

        let outcome = runner(config, &oracle, ActionRegistry::new().with(lookup.clone()))
            .run_outcome("q");

        let global = outcome.budget.global_count();
        assert!(global <= max_global, "budget {max_global} overrun: {global}");
        assert_eq!(global as usize, lookup.invocations());
        assert_eq!(outcome.session_log.len(), lookup.invocations());
        if outcome.stop == StopReason::BudgetExhausted {
            assert_eq!(global, max_global);
            assert!(outcome.answer.partial);
        }
    }
}

/// Remembered answers from the same session feed the next plan.
#[test]
fn memory_feeds_planner_and_records_answers() {
    let memory = Arc::new(InMemoryStore::new());
    memory
        .append("alice", "Q: SOL price\nA: SOL traded at 142 USD")
        .expect("seed memory");
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(Vec::<String>::new())
            .with_answer("SOL is still at 142 USD"),
    );

    let runner = runner(quiet_config(), &oracle, ActionRegistry::new())
        .with_memory(memory.clone())
        .with_session("alice");
    runner.run("what is the SOL price now");

    let contexts = oracle.plan_contexts();
    assert_eq!(contexts.len(), 1);
    assert!(
        contexts[0]
            .as_deref()
            .is_some_and(|c| c.contains("142 USD"))
    );
    let entries = memory.entries("alice");
    assert_eq!(entries.len(), 2);
    assert!(entries[1].contains("SOL is still at 142 USD"));
}

/// A panic outside every guarded call is turned into a fatal answer.
#[test]
fn escaping_panic_becomes_fatal_answer() {
    struct ExplodingMemory;

    impl MemoryStore for ExplodingMemory {
        fn append(&self, _session_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn retrieve(
            &self,
            _session_id: &str,
            _query: &str,
            _limit: usize,
        ) -> anyhow::Result<Vec<String>> {
            panic!("memory index corrupted")
        }
    }

    let oracle = Arc::new(ScriptedOracle::new().with_plan(vec!["a"]));
    let outcome = runner(quiet_config(), &oracle, ActionRegistry::new())
        .with_memory(Arc::new(ExplodingMemory))
        .run_outcome("q");

    assert_eq!(outcome.stop, StopReason::Fatal);
    assert!(outcome.answer.text.contains("memory index corrupted"));
    assert!(!outcome.answer.partial);
}

/// A finished run leaves the status line idle with its thread joined, and
/// only the final answer mark ends with a newline.
#[test]
fn progress_line_is_idle_after_run() {
    let buffer = SharedBuffer::default();
    let progress = ProgressReporter::with_writer(Box::new(buffer.clone()), 60);
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["one"])
            .with_actions(vec![Some(call("lookup", json!({})))])
            .always_done(true),
    );
    let registry = ActionRegistry::new().with(Arc::new(StubAction::new("lookup", json!("v"))));

    let runner = runner(quiet_config(), &oracle, registry).with_progress(progress.clone());
    runner.run("q");

    assert_eq!(progress.phase(), Phase::Idle);
    assert!(!progress.is_animating());
    let out = buffer.contents();
    assert_eq!(out.matches('\n').count(), 1);
    assert!(out.ends_with("✓ Answer ready\n"));
}

/// Runs with a record directory leave a JSON record behind.
#[test]
fn run_record_is_written_when_configured() {
    let workspace = TestWorkspace::new().expect("workspace");
    let config = LoopConfig {
        record_dir: Some(workspace.records_dir()),
        ..quiet_config()
    };
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["one"])
            .with_actions(vec![Some(call("lookup", json!({ "symbol": "SOL" })))])
            .always_done(true),
    );
    let registry = ActionRegistry::new().with(Arc::new(StubAction::new("lookup", json!(142))));

    let outcome = runner(config, &oracle, registry).run_outcome("price of SOL");

    let path = outcome.record_path.expect("record path");
    assert!(path.starts_with(workspace.records_dir()));
    let record: Value =
        serde_json::from_str(&fs::read_to_string(&path).expect("read record")).expect("json");
    assert_eq!(record["run_id"], outcome.run_id.as_str());
    assert_eq!(record["stop"], "completed");
    assert_eq!(record["steps"], 1);
    assert_eq!(record["tasks"][0]["done"], true);
    assert_eq!(record["session_log"][0]["result"]["output"], 142);
}

/// Config written by one run is read back by the next.
#[test]
fn workspace_config_round_trips() {
    let workspace = TestWorkspace::new().expect("workspace");
    let config = LoopConfig {
        max_global_steps: 7,
        ..quiet_config()
    };
    let path = workspace.write_config(&config).expect("write");
    let loaded = taskloop::io::config::load_config(&path).expect("load");
    assert_eq!(loaded.max_global_steps, 7);
    assert!(!loaded.progress);
}

/// A runner built, run and dropped from inside an async context still answers
/// and shuts down cleanly.
#[tokio::test]
async fn runs_and_drops_inside_async_runtime() {
    let lookup = Arc::new(StubAction::new("lookup", json!("142")));
    let oracle = Arc::new(
        ScriptedOracle::new()
            .with_plan(vec!["get SOL price"])
            .with_actions(vec![Some(call("lookup", json!({ "symbol": "SOL" })))])
            .always_done(true),
    );

    let runner = runner(quiet_config(), &oracle, ActionRegistry::new().with(lookup.clone()));
    let outcome = runner.run_outcome("price of SOL");
    drop(runner);

    assert_eq!(lookup.invocations(), 1);
    assert_eq!(outcome.stop, StopReason::Completed);
    assert!(!outcome.answer.partial);
    assert!(outcome.answer.text.contains("142"));
}
