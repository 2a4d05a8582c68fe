//! Bounded, oracle-guided task execution loop.
//!
//! A free-text request is planned into sub-tasks, each sub-task is worked by
//! asking a decision oracle for actions and executing them against an action
//! registry, and the collected outputs are synthesized into one answer. Step
//! budgets and a repetition guard keep every run finite.
//!
//! - **[`core`]**: Pure, deterministic logic (budgets, repetition signatures,
//!   task selection, shared types). No I/O.
//! - **[`io`]**: Side-effecting collaborators (oracle and action contracts,
//!   process execution, config, progress line, memory, run records).
//!
//! [`planner`], [`optimizer`] and [`looping`] coordinate the two.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod optimizer;
pub mod planner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
