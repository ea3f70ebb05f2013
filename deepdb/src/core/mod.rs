//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod escalation;
pub mod execution;
pub mod feedback;
pub mod looping;
pub mod sql;
pub mod stage;
pub mod state;
