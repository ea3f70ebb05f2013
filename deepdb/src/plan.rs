//! Orchestration for `deepdb plan`.
//!
//! Without feedback a fresh plan is drafted for the request. With feedback
//! the existing `.deepdb/plan.md` is handed to the planner for refinement.
//! The result always replaces `.deepdb/plan.md`; running it is a separate,
//! explicit step.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::agents::model_stage::StageContext;
use crate::core::state::{SessionState, StateKey, StateValue};
use crate::io::config::DeepdbConfig;
use crate::io::init::DeepdbPaths;
use crate::io::model::ModelExecutor;
use crate::io::plan_doc::{PlanDocument, read_plan, write_plan};
use crate::io::prompt::PromptEngine;
use crate::io::run_log::RunLog;
use crate::io::warehouse::Warehouse;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Research request; defaults to the one recorded in the current plan.
    pub request: Option<String>,
    /// Reviewer notes on the current plan.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub plan: PlanDocument,
    pub path: PathBuf,
    /// True when an existing plan was revised rather than drafted anew.
    pub refined: bool,
    pub run_id: String,
}

pub fn plan_research<E: ModelExecutor, W: Warehouse>(
    root: &Path,
    cfg: &DeepdbConfig,
    executor: &E,
    warehouse: &W,
    options: &PlanOptions,
) -> Result<PlanOutcome> {
    let paths = DeepdbPaths::new(root);
    let existing = read_plan(&paths.plan_path)?;
    let feedback = options
        .feedback
        .clone()
        .filter(|text| !text.trim().is_empty());

    let request = match (&options.request, &existing) {
        (Some(request), _) if !request.trim().is_empty() => request.trim().to_string(),
        (_, Some(doc)) => doc.request.clone(),
        _ => bail!("no research request given and no existing plan to refine"),
    };
    let previous = match (&feedback, existing) {
        (Some(_), Some(doc)) => Some(doc.plan),
        (Some(_), None) => {
            debug!("feedback given without an existing plan, drafting fresh");
            None
        }
        (None, _) => None,
    };
    let refined = previous.is_some();

    let prompts = PromptEngine::new(cfg.models.prompt_budget_bytes)?;
    let run_log = RunLog::create(root)?;
    let ctx = StageContext {
        executor,
        warehouse,
        prompts: &prompts,
        run_log: &run_log,
        models: &cfg.models,
        workdir: root.to_path_buf(),
    };

    let mut state = SessionState::seeded(&cfg.coordinates(), request.clone())
        .with_plan_feedback(feedback);
    if let Some(plan) = previous {
        state.write(StateKey::ResearchPlan, StateValue::Text(plan))?;
    }

    let plan = Pipeline::new(&ctx, &cfg.loops).draft_plan(&mut state)?;
    let doc = PlanDocument { request, plan };
    write_plan(&paths.plan_path, &doc)?;
    info!(path = %paths.plan_path.display(), refined, "research plan written");

    Ok(PlanOutcome {
        plan: doc,
        path: paths.plan_path,
        refined,
        run_id: run_log.run_id().to_string(),
    })
}
