//! Evaluator feedback records and their semantic invariants.

use serde::{Deserialize, Serialize};

/// Evaluation result for a research report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Pass,
    Fail,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Grade::Pass => "pass",
            Grade::Fail => "fail",
        }
    }
}

/// Category of factual-accuracy problem flagged by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Hallucination,
    UnsupportedClaim,
    ContradictoryInfo,
    Overgeneralization,
    MissingContext,
}

/// A single correction the revision stage must apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Correction {
    /// Section, paragraph, or statement where the issue was found.
    pub section_identifier: String,
    /// Exact quote of the questionable text.
    pub problematic_content: String,
    pub issue_type: IssueType,
    /// How to correct or verify the content.
    pub correction_instruction: String,
}

/// Structured evaluator output stored at `research_evaluation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Feedback {
    pub grade: Grade,
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrections_needed: Option<Vec<Correction>>,
}

impl Feedback {
    /// Corrections as a slice; absent and empty are equivalent.
    pub fn corrections(&self) -> &[Correction] {
        self.corrections_needed.as_deref().unwrap_or_default()
    }

    /// Check invariants the type system does not enforce:
    /// - `grade = pass` implies no corrections
    /// - `comment` is non-blank
    /// - every correction field is non-blank
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.grade == Grade::Pass && !self.corrections().is_empty() {
            errors.push(format!(
                "grade is pass but corrections_needed has {} entries",
                self.corrections().len()
            ));
        }
        if self.comment.trim().is_empty() {
            errors.push("comment must be non-empty".to_string());
        }
        for (idx, correction) in self.corrections().iter().enumerate() {
            for (field, value) in [
                ("section_identifier", &correction.section_identifier),
                ("problematic_content", &correction.problematic_content),
                ("correction_instruction", &correction.correction_instruction),
            ] {
                if value.trim().is_empty() {
                    errors.push(format!("corrections_needed[{idx}].{field} must be non-empty"));
                }
            }
        }
        errors
    }

    /// True when the record is a well-formed pass.
    pub fn is_clean_pass(&self) -> bool {
        self.grade == Grade::Pass && self.invariant_violations().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{correction, failing_feedback, passing_feedback};

    #[test]
    fn pass_without_corrections_is_clean() {
        let feedback = passing_feedback();
        assert!(feedback.invariant_violations().is_empty());
        assert!(feedback.is_clean_pass());
    }

    #[test]
    fn pass_with_empty_list_is_clean() {
        let mut feedback = passing_feedback();
        feedback.corrections_needed = Some(Vec::new());
        assert!(feedback.is_clean_pass());
    }

    #[test]
    fn pass_with_corrections_is_a_violation() {
        let mut feedback = passing_feedback();
        feedback.corrections_needed = Some(vec![correction("Intro", IssueType::Hallucination)]);

        let errors = feedback.invariant_violations();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("grade is pass"));
        assert!(!feedback.is_clean_pass());
    }

    #[test]
    fn fail_with_corrections_is_valid_but_not_a_pass() {
        let feedback = failing_feedback(vec![correction("Findings", IssueType::UnsupportedClaim)]);
        assert!(feedback.invariant_violations().is_empty());
        assert!(!feedback.is_clean_pass());
    }

    #[test]
    fn fail_without_corrections_is_accepted() {
        let feedback = failing_feedback(Vec::new());
        assert!(feedback.invariant_violations().is_empty());
        assert!(!feedback.is_clean_pass());
    }

    #[test]
    fn blank_fields_are_reported() {
        let mut bad = correction("", IssueType::MissingContext);
        bad.correction_instruction = "  ".to_string();
        let mut feedback = failing_feedback(vec![bad]);
        feedback.comment = String::new();

        let errors = feedback.invariant_violations();
        assert!(errors.iter().any(|err| err.contains("comment")));
        assert!(errors.iter().any(|err| err.contains("[0].section_identifier")));
        assert!(errors.iter().any(|err| err.contains("[0].correction_instruction")));
    }

    #[test]
    fn parses_snake_case_issue_types() {
        let raw = r#"{
            "grade": "fail",
            "comment": "two issues",
            "corrections_needed": [{
                "section_identifier": "Summary",
                "problematic_content": "revenue tripled",
                "issue_type": "contradictory_info",
                "correction_instruction": "use the reported 12% growth"
            }]
        }"#;
        let feedback: Feedback = serde_json::from_str(raw).expect("parse");
        assert_eq!(feedback.grade, Grade::Fail);
        assert_eq!(feedback.corrections()[0].issue_type, IssueType::ContradictoryInfo);
    }

    #[test]
    fn rejects_unknown_grade() {
        let raw = r#"{"grade": "maybe", "comment": "?"}"#;
        assert!(serde_json::from_str::<Feedback>(raw).is_err());
    }
}
