//! Bounded loop controller.
//!
//! Re-runs an ordered stage list until a stage escalates or the iteration cap
//! is reached. An iteration always runs every stage before termination is
//! evaluated; escalation never skips the remaining stages of its iteration.

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};

use crate::core::stage::{Stage, StageSignal};
use crate::core::state::SessionState;

/// Reason why a loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// A stage escalated during `iteration`.
    Escalated { iteration: u32 },
    /// All `max_iterations` iterations ran without escalation.
    MaxIterations { max_iterations: u32 },
}

/// Summary of a loop invocation. Results themselves live in state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub name: String,
    pub iterations: u32,
    pub stop: LoopStop,
}

/// Iteration bookkeeping passed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    /// 1-indexed iteration number.
    pub iteration: u32,
    pub escalated: bool,
}

/// Runs an ordered list of stages up to `max_iterations` times.
pub struct LoopController<'a> {
    name: String,
    max_iterations: u32,
    stages: Vec<Box<dyn Stage + 'a>>,
}

impl<'a> LoopController<'a> {
    pub fn new(
        name: impl Into<String>,
        max_iterations: u32,
        stages: Vec<Box<dyn Stage + 'a>>,
    ) -> Result<Self> {
        let name = name.into();
        if max_iterations == 0 {
            bail!("{name}: max_iterations must be > 0");
        }
        if stages.is_empty() {
            bail!("{name}: loop needs at least one stage");
        }
        Ok(Self {
            name,
            max_iterations,
            stages,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Run the loop over `state`.
    ///
    /// Stage failures abort the loop immediately and are returned unchanged
    /// apart from added context; the loop never retries a stage in place.
    #[instrument(skip_all, fields(name = %self.name, max_iterations = self.max_iterations))]
    pub fn run<F>(&self, state: &mut SessionState, mut on_iteration: F) -> Result<LoopOutcome>
    where
        F: FnMut(&IterationReport, &SessionState) -> Result<()>,
    {
        for iteration in 1..=self.max_iterations {
            let mut escalated = false;
            for stage in &self.stages {
                debug!(iteration, stage = stage.name(), "running stage");
                let signal = stage.run(state).with_context(|| {
                    format!(
                        "{} iteration {iteration}: stage {} failed",
                        self.name,
                        stage.name()
                    )
                })?;
                if signal == StageSignal::Escalate {
                    debug!(iteration, stage = stage.name(), "stage escalated");
                    escalated = true;
                }
            }

            on_iteration(
                &IterationReport {
                    iteration,
                    escalated,
                },
                state,
            )?;

            if escalated {
                info!(iteration, "loop escalated");
                return Ok(LoopOutcome {
                    name: self.name.clone(),
                    iterations: iteration,
                    stop: LoopStop::Escalated { iteration },
                });
            }
        }

        info!("loop reached max iterations");
        Ok(LoopOutcome {
            name: self.name.clone(),
            iterations: self.max_iterations,
            stop: LoopStop::MaxIterations {
                max_iterations: self.max_iterations,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::escalation::escalation_checker;
    use crate::core::feedback::Feedback;
    use crate::core::state::{StateKey, StateValue};
    use crate::test_support::{coordinates, failing_feedback, passing_feedback};
    use anyhow::anyhow;
    use std::cell::{Cell, RefCell};

    /// Appends its name to a shared journal and writes a counter to its key.
    struct Recording<'j> {
        name: &'static str,
        key: StateKey,
        journal: &'j RefCell<Vec<String>>,
        calls: Cell<u32>,
    }

    impl<'j> Recording<'j> {
        fn new(name: &'static str, key: StateKey, journal: &'j RefCell<Vec<String>>) -> Self {
            Self {
                name,
                key,
                journal,
                calls: Cell::new(0),
            }
        }
    }

    impl Stage for Recording<'_> {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, state: &mut SessionState) -> Result<StageSignal> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            self.journal.borrow_mut().push(format!("{}#{call}", self.name));
            state.write(self.key, StateValue::Text(format!("{} {call}", self.name)))?;
            Ok(StageSignal::Continue)
        }
    }

    /// Writes scripted evaluations in order.
    struct ScriptedEvaluator<'j> {
        grades: RefCell<Vec<Feedback>>,
        journal: &'j RefCell<Vec<String>>,
    }

    impl Stage for ScriptedEvaluator<'_> {
        fn name(&self) -> &str {
            "evaluate"
        }

        fn run(&self, state: &mut SessionState) -> Result<StageSignal> {
            let next = self.grades.borrow_mut().remove(0);
            self.journal.borrow_mut().push(format!("evaluate:{}", next.grade.as_str()));
            state.write(StateKey::ResearchEvaluation, StateValue::Evaluation(next))?;
            Ok(StageSignal::Continue)
        }
    }

    struct Failing;

    impl Stage for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _state: &mut SessionState) -> Result<StageSignal> {
            Err(anyhow!("model endpoint unreachable"))
        }
    }

    fn state() -> SessionState {
        SessionState::seeded(&coordinates(), "q")
    }

    #[test]
    fn rejects_zero_iterations_and_empty_stage_list() {
        let journal = RefCell::new(Vec::new());
        let stage = Recording::new("a", StateKey::ReportSections, &journal);
        assert!(LoopController::new("l", 0, vec![Box::new(stage)]).is_err());
        assert!(LoopController::new("l", 3, Vec::new()).is_err());
    }

    #[test]
    fn runs_exactly_max_iterations_without_escalation() {
        let journal = RefCell::new(Vec::new());
        let controller = LoopController::new(
            "query_refinement_loop",
            5,
            vec![
                Box::new(Recording::new("execute", StateKey::ReportSections, &journal)),
                Box::new(Recording::new(
                    "review",
                    StateKey::QueryReviewRewriteOutput,
                    &journal,
                )),
            ],
        )
        .expect("controller");

        let mut state = state();
        let outcome = controller.run(&mut state, |_, _| Ok(())).expect("run");

        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 5 });
        assert_eq!(journal.borrow().len(), 10);
        assert_eq!(journal.borrow().last().map(String::as_str), Some("review#5"));
    }

    #[test]
    fn stops_after_escalating_iteration_but_finishes_it() {
        let journal = RefCell::new(Vec::new());
        let controller = LoopController::new(
            "iterative_refinement_loop",
            3,
            vec![
                Box::new(ScriptedEvaluator {
                    grades: RefCell::new(vec![failing_feedback(Vec::new()), passing_feedback()]),
                    journal: &journal,
                }),
                Box::new(escalation_checker("escalation_checker")),
                Box::new(Recording::new(
                    "revise",
                    StateKey::FinalRevisedReport,
                    &journal,
                )),
            ],
        )
        .expect("controller");

        let mut state = state();
        let outcome = controller.run(&mut state, |_, _| Ok(())).expect("run");

        assert_eq!(outcome.stop, LoopStop::Escalated { iteration: 2 });
        assert_eq!(outcome.iterations, 2);
        assert_eq!(
            *journal.borrow(),
            vec!["evaluate:fail", "revise#1", "evaluate:pass", "revise#2"]
        );
        assert_eq!(state.text(StateKey::FinalRevisedReport), Some("revise 2"));
    }

    #[test]
    fn observer_sees_only_latest_values_each_iteration() {
        let journal = RefCell::new(Vec::new());
        let controller = LoopController::new(
            "l",
            3,
            vec![Box::new(Recording::new(
                "review",
                StateKey::QueryReviewRewriteOutput,
                &journal,
            ))],
        )
        .expect("controller");

        let mut seen = Vec::new();
        let mut state = state();
        controller
            .run(&mut state, |report, state| {
                let snapshot = serde_json::to_string(state)?;
                for earlier in 1..report.iteration {
                    assert!(!snapshot.contains(&format!("\"review {earlier}\"")));
                }
                seen.push(state.text(StateKey::QueryReviewRewriteOutput).map(str::to_string));
                Ok(())
            })
            .expect("run");

        assert_eq!(
            seen,
            vec![
                Some("review 1".to_string()),
                Some("review 2".to_string()),
                Some("review 3".to_string())
            ]
        );
    }

    #[test]
    fn stage_failure_aborts_the_loop() {
        let journal = RefCell::new(Vec::new());
        let controller = LoopController::new(
            "l",
            5,
            vec![
                Box::new(Recording::new("first", StateKey::ReportSections, &journal)),
                Box::new(Failing),
                Box::new(Recording::new("never", StateKey::FinalReport, &journal)),
            ],
        )
        .expect("controller");

        let mut state = state();
        let err = controller.run(&mut state, |_, _| Ok(())).unwrap_err();

        assert!(format!("{err:#}").contains("model endpoint unreachable"));
        assert!(err.to_string().contains("iteration 1: stage failing failed"));
        assert_eq!(*journal.borrow(), vec!["first#1"]);
        assert!(!state.is_set(StateKey::FinalReport));
    }
}
