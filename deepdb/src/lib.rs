//! NL-to-SQL research pipeline driven by model stages.
//!
//! A session runs a fixed composition of stages over one typed state:
//!
//! - **[`core`]**: State, feedback records, loop control and escalation.
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Config, model and warehouse subprocesses, prompts, run logs.
//! - **[`agents`]**: The model-backed stages and their declarations.
//!
//! [`pipeline`] composes stages into the SQL agent and the research pipeline;
//! the command modules ([`plan`], [`run`], [`check`], [`render`]) back the CLI.

pub mod agents;
pub mod check;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod plan;
pub mod render;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
