//! Stable exit codes for the taskloop CLI.

/// Command succeeded; for `run`, a complete answer was produced.
pub const OK: i32 = 0;
/// Invalid config or usage, or any other error before an answer exists.
pub const INVALID: i32 = 1;
/// `taskloop run` produced an answer, but a partial one (budget or repetition).
pub const PARTIAL: i32 = 2;
