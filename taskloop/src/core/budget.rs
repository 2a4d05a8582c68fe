//! Step budget accounting for a single run.

use serde::Serialize;

pub const DEFAULT_MAX_GLOBAL_STEPS: u32 = 20;
pub const DEFAULT_MAX_STEPS_PER_TASK: u32 = 5;

/// Global and per-task step counters with hard caps.
///
/// `global_count` never decreases and never exceeds `max_global`.
/// `per_task_count` is reset whenever the loop selects a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepBudget {
    global_count: u32,
    max_global: u32,
    per_task_count: u32,
    max_per_task: u32,
}

impl Default for StepBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GLOBAL_STEPS, DEFAULT_MAX_STEPS_PER_TASK)
    }
}

impl StepBudget {
    pub fn new(max_global: u32, max_per_task: u32) -> Self {
        Self {
            global_count: 0,
            max_global,
            per_task_count: 0,
            max_per_task,
        }
    }

    /// Consume one step. Returns `false` without touching the counters when the
    /// global budget is already spent.
    pub fn try_consume(&mut self) -> bool {
        if self.global_exhausted() {
            return false;
        }
        self.global_count += 1;
        self.per_task_count += 1;
        true
    }

    pub fn reset_per_task(&mut self) {
        self.per_task_count = 0;
    }

    pub fn global_exhausted(&self) -> bool {
        self.global_count >= self.max_global
    }

    pub fn per_task_exhausted(&self) -> bool {
        self.per_task_count >= self.max_per_task
    }

    pub fn global_count(&self) -> u32 {
        self.global_count
    }

    pub fn per_task_count(&self) -> u32 {
        self.per_task_count
    }

    pub fn max_global(&self) -> u32 {
        self.max_global
    }

    pub fn max_per_task(&self) -> u32 {
        self.max_per_task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_stops_at_global_cap_without_incrementing() {
        let mut budget = StepBudget::new(2, 10);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.global_exhausted());
        assert!(!budget.try_consume());
        assert_eq!(budget.global_count(), 2);
        assert_eq!(budget.per_task_count(), 2);
    }

    #[test]
    fn reset_only_touches_per_task_counter() {
        let mut budget = StepBudget::new(10, 2);
        budget.try_consume();
        budget.try_consume();
        assert!(budget.per_task_exhausted());

        budget.reset_per_task();
        assert!(!budget.per_task_exhausted());
        assert_eq!(budget.per_task_count(), 0);
        assert_eq!(budget.global_count(), 2);
    }

    #[test]
    fn global_count_is_monotonic_across_resets() {
        let mut budget = StepBudget::new(7, 3);
        let mut last = 0;
        for i in 0..20 {
            if i % 3 == 0 {
                budget.reset_per_task();
            }
            budget.try_consume();
            assert!(budget.global_count() >= last);
            assert!(budget.global_count() <= budget.max_global());
            last = budget.global_count();
        }
        assert_eq!(last, 7);
    }

    #[test]
    fn zero_budget_is_exhausted_immediately() {
        let mut budget = StepBudget::new(0, 5);
        assert!(budget.global_exhausted());
        assert!(!budget.try_consume());
    }
}
