//! `deepdb render`: preview a stage prompt for a saved state snapshot.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use crate::agents::find_stage;
use crate::core::execution::QueryResult;
use crate::core::state::SessionState;
use crate::io::prompt::{PromptEngine, ToolTurn};
use crate::io::warehouse::Warehouse;

/// Stands in for the warehouse so tool descriptions can be listed.
struct Offline;

impl Warehouse for Offline {
    fn execute_sql(&self, _sql: &str) -> Result<QueryResult> {
        bail!("prompt preview has no warehouse")
    }

    fn list_dataset_ids(&self) -> Result<Vec<String>> {
        bail!("prompt preview has no warehouse")
    }

    fn get_dataset_info(&self, _dataset_id: &str) -> Result<Option<Value>> {
        bail!("prompt preview has no warehouse")
    }

    fn list_table_ids(&self) -> Result<Vec<String>> {
        bail!("prompt preview has no warehouse")
    }

    fn get_table_info(&self, _table_id: &str) -> Result<Option<Value>> {
        bail!("prompt preview has no warehouse")
    }
}

pub fn load_state(path: &Path) -> Result<SessionState> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse state snapshot {}", path.display()))
}

/// First-turn prompt of `stage` over `state`.
pub fn render_stage_prompt(stage: &str, state: &SessionState, budget_bytes: usize) -> Result<String> {
    let spec = find_stage(stage).ok_or_else(|| {
        let known: Vec<&str> = crate::agents::all_stages().map(|spec| spec.name).collect();
        anyhow!("unknown stage {stage:?}; known stages: {}", known.join(", "))
    })?;
    let missing: Vec<&str> = spec
        .required
        .iter()
        .filter(|key| !state.is_set(**key))
        .map(|key| key.as_str())
        .collect();
    if !missing.is_empty() {
        bail!(
            "state snapshot lacks keys {stage} requires: {}",
            missing.join(", ")
        );
    }

    let engine = PromptEngine::new(budget_bytes)?;
    let offline = Offline;
    let tools = spec.toolset.bind(&offline);
    let specs = tools.map(|tools| tools.specs());
    let turn = specs.as_deref().map(|specs| ToolTurn {
        specs,
        transcript: &[],
        remaining_calls: 0,
    });
    engine.render(spec.template, state, turn)
}
