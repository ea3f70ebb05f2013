//! Escalation check for the research evaluation loop.

use tracing::{debug, warn};

use crate::core::feedback::Grade;
use crate::core::stage::{GateStage, StageSignal};
use crate::core::state::{EvaluationSlot, SessionState};

/// Why the loop should keep iterating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinueReason {
    /// The evaluator graded the report `fail`.
    Failed,
    /// No evaluation in state yet.
    Missing,
    /// The evaluation does not have the feedback shape.
    Unparsable,
    /// A `pass` that breaks the feedback invariants (e.g. pass with corrections).
    ContractViolation(Vec<String>),
}

/// Decision taken on the latest evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    Terminate,
    Continue(ContinueReason),
}

/// Decide whether the research loop may stop.
///
/// Only a well-formed `pass` terminates. Anything missing or malformed keeps
/// the loop running.
pub fn check_escalation(state: &SessionState) -> Escalation {
    match state.evaluation() {
        None => Escalation::Continue(ContinueReason::Missing),
        Some(EvaluationSlot::Unparsed(_)) => Escalation::Continue(ContinueReason::Unparsable),
        Some(EvaluationSlot::Parsed(feedback)) => match feedback.grade {
            Grade::Fail => Escalation::Continue(ContinueReason::Failed),
            Grade::Pass => {
                let violations = feedback.invariant_violations();
                if violations.is_empty() {
                    Escalation::Terminate
                } else {
                    Escalation::Continue(ContinueReason::ContractViolation(violations))
                }
            }
        },
    }
}

/// Gate stage wrapping [`check_escalation`], logging non-terminal anomalies.
pub fn escalation_checker(
    name: &str,
) -> GateStage<impl Fn(&SessionState) -> StageSignal> {
    let stage_name = name.to_string();
    GateStage::new(name, move |state: &SessionState| match check_escalation(state) {
        Escalation::Terminate => {
            debug!(stage = %stage_name, "evaluation passed, escalating");
            StageSignal::Escalate
        }
        Escalation::Continue(ContinueReason::Failed) => {
            debug!(stage = %stage_name, "evaluation failed, continuing");
            StageSignal::Continue
        }
        Escalation::Continue(ContinueReason::Missing) => {
            warn!(stage = %stage_name, "research_evaluation missing, continuing");
            StageSignal::Continue
        }
        Escalation::Continue(ContinueReason::Unparsable) => {
            warn!(stage = %stage_name, "research_evaluation unparsable, continuing");
            StageSignal::Continue
        }
        Escalation::Continue(ContinueReason::ContractViolation(violations)) => {
            warn!(
                stage = %stage_name,
                violations = %violations.join("; "),
                "research_evaluation violates feedback contract, continuing"
            );
            StageSignal::Continue
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::feedback::IssueType;
    use crate::core::stage::Stage;
    use crate::core::state::{StateKey, StateValue};
    use crate::test_support::{coordinates, correction, failing_feedback, passing_feedback};

    fn state_with(feedback: Option<crate::core::feedback::Feedback>) -> SessionState {
        let mut state = SessionState::seeded(&coordinates(), "q");
        if let Some(feedback) = feedback {
            state
                .write(StateKey::ResearchEvaluation, StateValue::Evaluation(feedback))
                .expect("write");
        }
        state
    }

    #[test]
    fn pass_terminates() {
        assert_eq!(
            check_escalation(&state_with(Some(passing_feedback()))),
            Escalation::Terminate
        );
    }

    #[test]
    fn fail_continues() {
        let state = state_with(Some(failing_feedback(vec![correction(
            "Summary",
            IssueType::Hallucination,
        )])));
        assert_eq!(
            check_escalation(&state),
            Escalation::Continue(ContinueReason::Failed)
        );
    }

    #[test]
    fn missing_evaluation_continues() {
        assert_eq!(
            check_escalation(&state_with(None)),
            Escalation::Continue(ContinueReason::Missing)
        );
    }

    #[test]
    fn unparsable_evaluation_continues() {
        let mut value = serde_json::to_value(state_with(None)).expect("serialize");
        value["research_evaluation"] = serde_json::json!("looks fine to me");
        let state: SessionState = serde_json::from_value(value).expect("load");
        assert_eq!(
            check_escalation(&state),
            Escalation::Continue(ContinueReason::Unparsable)
        );
    }

    #[test]
    fn pass_with_corrections_is_flagged_not_accepted() {
        let mut feedback = passing_feedback();
        feedback.corrections_needed = Some(vec![correction("Intro", IssueType::MissingContext)]);
        match check_escalation(&state_with(Some(feedback))) {
            Escalation::Continue(ContinueReason::ContractViolation(violations)) => {
                assert!(violations[0].contains("grade is pass"));
            }
            other => panic!("expected contract violation, got {other:?}"),
        }
    }

    #[test]
    fn checker_stage_signals_and_leaves_state_untouched() {
        let checker = escalation_checker("escalation_checker");
        let mut state = state_with(Some(passing_feedback()));
        let before = state.clone();
        assert_eq!(checker.run(&mut state).expect("run"), StageSignal::Escalate);
        assert_eq!(state, before);

        let mut empty = state_with(None);
        assert_eq!(checker.run(&mut empty).expect("run"), StageSignal::Continue);
    }
}
