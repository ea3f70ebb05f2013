//! Wall-clock budget for a stage's model and tool calls.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};

/// Time left before `deadline`, or an error once it has passed.
///
/// A stage computes one deadline up front and every model turn it makes
/// receives only what remains of it.
pub fn remaining_budget(deadline: Instant, stage: &str) -> Result<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        bail!("stage {stage} exceeded its time budget");
    }
    Ok(remaining)
}
