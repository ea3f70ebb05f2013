//! Stable exit codes for deepdb CLI commands.

/// Command succeeded; `check` found a valid passing record.
pub const OK: i32 = 0;
/// Invalid input, configuration, or a failed run.
pub const INVALID: i32 = 1;
/// `check` found a valid record graded `fail`.
pub const GRADE_FAIL: i32 = 2;
