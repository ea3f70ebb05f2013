//! Side-effecting collaborators: config, subprocesses, prompts and run artifacts.

pub mod config;
pub mod init;
pub mod model;
pub mod plan_doc;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod schema;
pub mod tools;
pub mod warehouse;
