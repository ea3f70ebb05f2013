//! Orchestration for `deepdb run`.
//!
//! Seeds a fresh session from configuration and the approved plan, runs the
//! research pipeline, and stores `final_report.md` next to the run's stage
//! artifacts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::agents::model_stage::StageContext;
use crate::core::state::{SessionState, StateKey, StateValue};
use crate::io::config::DeepdbConfig;
use crate::io::init::DeepdbPaths;
use crate::io::model::ModelExecutor;
use crate::io::plan_doc::read_plan;
use crate::io::prompt::PromptEngine;
use crate::io::run_log::RunLog;
use crate::io::warehouse::Warehouse;
use crate::pipeline::{Pipeline, PipelineOutcome};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Plan to execute instead of `.deepdb/plan.md`.
    pub plan_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub report_path: PathBuf,
    pub outcome: PipelineOutcome,
}

/// Execute the approved plan end to end.
pub fn run_research<E: ModelExecutor, W: Warehouse>(
    root: &Path,
    cfg: &DeepdbConfig,
    executor: &E,
    warehouse: &W,
    options: &RunOptions,
) -> Result<RunSummary> {
    let paths = DeepdbPaths::new(root);
    let plan_path = options.plan_path.clone().unwrap_or(paths.plan_path);
    let doc = read_plan(&plan_path)?.ok_or_else(|| {
        anyhow!(
            "no approved plan at {} (run `deepdb plan` first)",
            plan_path.display()
        )
    })?;

    let prompts = PromptEngine::new(cfg.models.prompt_budget_bytes)?;
    let run_log = RunLog::create(root)?;
    info!(run_id = %run_log.run_id(), plan = %plan_path.display(), "starting research run");

    let ctx = StageContext {
        executor,
        warehouse,
        prompts: &prompts,
        run_log: &run_log,
        models: &cfg.models,
        workdir: root.to_path_buf(),
    };
    let mut state = SessionState::seeded(&cfg.coordinates(), doc.request);
    state.write(StateKey::ResearchPlan, StateValue::Text(doc.plan))?;

    let outcome = Pipeline::new(&ctx, &cfg.loops)
        .run_research(&mut state)
        .with_context(|| format!("run {} failed", run_log.run_id()))?;
    let report_path = run_log.write_text("final_report.md", &outcome.final_report)?;

    Ok(RunSummary {
        run_id: run_log.run_id().to_string(),
        run_dir: run_log.dir().to_path_buf(),
        report_path,
        outcome,
    })
}
