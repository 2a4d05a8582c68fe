//! Deterministic, pure logic shared by the task loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod repetition;
pub mod selector;
pub mod types;
