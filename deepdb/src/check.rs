//! `deepdb check`: validate a feedback record offline.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::feedback::{Feedback, Grade};
use crate::io::schema::load_feedback;

/// Verdict of a valid feedback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Fail { corrections: usize },
}

/// Validate raw JSON against the schema and invariants.
///
/// `Err` means the record itself is invalid.
pub fn check_feedback(raw: &str) -> Result<(Feedback, CheckOutcome)> {
    let feedback = load_feedback(raw)?;
    let outcome = match feedback.grade {
        Grade::Pass => CheckOutcome::Pass,
        Grade::Fail => CheckOutcome::Fail {
            corrections: feedback.corrections().len(),
        },
    };
    Ok((feedback, outcome))
}

pub fn check_feedback_file(path: &Path) -> Result<(Feedback, CheckOutcome)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    check_feedback(&raw).with_context(|| format!("invalid feedback in {}", path.display()))
}
