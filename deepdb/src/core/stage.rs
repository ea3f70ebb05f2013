//! Stage abstraction shared by loop controllers and pipelines.

use anyhow::Result;

use crate::core::state::SessionState;

/// Control-flow signal returned by a stage after it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSignal {
    /// Normal completion; the enclosing loop keeps going.
    Continue,
    /// Ask the enclosing loop to stop after the current iteration.
    Escalate,
}

/// A unit of pipeline work.
///
/// Stages read and write [`SessionState`] only; they never call each other.
/// A stage that fails must leave its output key untouched.
pub trait Stage {
    fn name(&self) -> &str;
    fn run(&self, state: &mut SessionState) -> Result<StageSignal>;
}

/// Deterministic stage that evaluates a condition over state.
///
/// Gate stages never mutate state; their only effect is the returned signal.
pub struct GateStage<F> {
    name: String,
    condition: F,
}

impl<F> GateStage<F>
where
    F: Fn(&SessionState) -> StageSignal,
{
    pub fn new(name: impl Into<String>, condition: F) -> Self {
        Self {
            name: name.into(),
            condition,
        }
    }
}

impl<F> Stage for GateStage<F>
where
    F: Fn(&SessionState) -> StageSignal,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: &mut SessionState) -> Result<StageSignal> {
        Ok((self.condition)(state))
    }
}
