//! Stable exit codes for the `coder` CLI.

/// Session completed or stopped at the step budget; dry runs and `coder tools`.
pub const OK: i32 = 0;
/// Session ended with an error, or usage/config was invalid.
pub const ERROR: i32 = 1;
