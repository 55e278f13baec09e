//! Sandboxed tool-calling execution engine.
//!
//! One free-text instruction becomes a bounded dialogue with a local model:
//! the model asks for tool calls, the engine runs them inside a sandbox and
//! feeds the results back until the model stops calling tools or the step
//! budget runs out.
//!
//! - **[`core`]**: Pure logic (session state machine, fragment accumulation,
//!   lenient argument recovery, command tokenization). No I/O.
//! - **[`io`]**: Side effects (sandbox checks and processes, model HTTP
//!   adapters, config, prompts, transcripts).
//! - **[`tools`]** and **[`dispatch`]**: The closed tool registry and the
//!   validating dispatcher.
//! - **[`driver`]**: Runs one session end to end.

pub mod core;
pub mod dispatch;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
