//! Deterministic task selection.

use crate::core::types::Task;

/// Index of the first task with `done=false`, in plan order.
///
/// Returns `None` when every task is done (or the plan is empty).
pub fn first_open_task(tasks: &[Task]) -> Option<usize> {
    tasks.iter().position(|task| !task.done)
}

/// Mark the task at `index` as done. Done never reverts.
pub fn mark_done(tasks: &mut [Task], index: usize) {
    if let Some(task) = tasks.get_mut(index) {
        task.done = true;
    }
}
