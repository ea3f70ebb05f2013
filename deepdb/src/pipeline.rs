//! Stage composition: the SQL agent, the research pipeline and plan drafting.
//!
//! Every top-level step and every loop iteration rewrites the run's
//! `state.json` so a failed run leaves its last consistent state behind.

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::agents::model_stage::{ModelStage, StageContext, StageSpec};
use crate::agents::research::{
    PLAN_CREATOR, REPORT_COMPOSER, REPORT_REVISION, REPORT_STRUCTURE_PLANNER,
    RESEARCH_EVALUATOR, SECTION_RESEARCH,
};
use crate::agents::sql::{
    QUERY_EXECUTION, QUERY_GENERATION, QUERY_REVIEW_REWRITE, QUERY_UNDERSTANDING,
};
use crate::core::escalation::escalation_checker;
use crate::core::execution::{ExecutionReport, QueryError};
use crate::core::looping::{IterationReport, LoopController, LoopOutcome};
use crate::core::stage::{Stage, StageSignal};
use crate::core::state::{SessionState, StateKey};
use crate::io::config::LoopConfig;

pub const QUERY_REFINEMENT_LOOP: &str = "query_refinement_loop";
pub const ITERATIVE_REFINEMENT_LOOP: &str = "iterative_refinement_loop";
pub const ESCALATION_CHECKER: &str = "escalation_checker";

/// Summary of a research pipeline run. The report itself is also in state.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub sql_loop: LoopOutcome,
    pub research_loop: LoopOutcome,
    /// Set when the last execution of the SQL loop still failed.
    pub unresolved_query_error: Option<QueryError>,
    pub final_report: String,
}

/// Runs stages against one session state.
pub struct Pipeline<'a> {
    ctx: &'a StageContext<'a>,
    loops: &'a LoopConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a StageContext<'a>, loops: &'a LoopConfig) -> Self {
        Self { ctx, loops }
    }

    fn stage(&self, spec: StageSpec) -> ModelStage<'a> {
        ModelStage::new(spec, self.ctx)
    }

    /// Run one stage outside any loop, then snapshot state.
    fn step(&self, spec: StageSpec, state: &mut SessionState) -> Result<()> {
        let signal = self.stage(spec).run(state)?;
        if signal == StageSignal::Escalate {
            warn!(stage = spec.name, "escalation outside a loop ignored");
        }
        self.ctx.run_log.write_state(state)
    }

    fn record_iteration(
        &self,
        loop_name: &str,
        report: &IterationReport,
        state: &SessionState,
    ) -> Result<()> {
        info!(
            loop_name,
            iteration = report.iteration,
            escalated = report.escalated,
            "loop iteration complete"
        );
        self.ctx.run_log.write_state(state)
    }

    /// Understanding, generation, then the execute/review refinement loop.
    ///
    /// The refinement loop has no termination check and always runs
    /// `sql_refinement_iterations` times, even after a clean execution.
    #[instrument(skip_all)]
    pub fn run_sql_agent(&self, state: &mut SessionState) -> Result<LoopOutcome> {
        self.step(QUERY_UNDERSTANDING, state)?;
        self.step(QUERY_GENERATION, state)?;

        let stages: Vec<Box<dyn Stage + 'a>> = vec![
            Box::new(self.stage(QUERY_EXECUTION)),
            Box::new(self.stage(QUERY_REVIEW_REWRITE)),
        ];
        let refinement = LoopController::new(
            QUERY_REFINEMENT_LOOP,
            self.loops.sql_refinement_iterations,
            stages,
        )?;
        refinement.run(state, |report, state| {
            self.record_iteration(QUERY_REFINEMENT_LOOP, report, state)
        })
    }

    /// The full pipeline over an approved `research_plan`.
    #[instrument(skip_all, fields(
        sql_iterations = self.loops.sql_refinement_iterations,
        feedback_iterations = self.loops.max_feedback_iterations,
    ))]
    pub fn run_research(&self, state: &mut SessionState) -> Result<PipelineOutcome> {
        if state.text(StateKey::ResearchPlan).is_none_or(|plan| plan.trim().is_empty()) {
            bail!("research pipeline needs an approved research_plan");
        }
        self.ctx.run_log.write_state(state)?;

        let sql_loop = self.run_sql_agent(state).context("sql agent")?;
        let unresolved_query_error = match state.execution() {
            Some(ExecutionReport::Error { error }) => {
                warn!(
                    error_type = %error.error_type,
                    message = %error.message,
                    "query still failing after refinement, continuing with the error report"
                );
                Some(error.clone())
            }
            _ => None,
        };

        self.step(REPORT_STRUCTURE_PLANNER, state)?;
        self.step(SECTION_RESEARCH, state)?;

        let stages: Vec<Box<dyn Stage + 'a>> = vec![
            Box::new(self.stage(RESEARCH_EVALUATOR)),
            Box::new(escalation_checker(ESCALATION_CHECKER)),
            Box::new(self.stage(REPORT_REVISION)),
        ];
        let refinement = LoopController::new(
            ITERATIVE_REFINEMENT_LOOP,
            self.loops.max_feedback_iterations,
            stages,
        )?;
        let research_loop = refinement.run(state, |report, state| {
            self.record_iteration(ITERATIVE_REFINEMENT_LOOP, report, state)
        })?;

        self.step(REPORT_COMPOSER, state)?;
        let final_report = state
            .text(StateKey::FinalReport)
            .ok_or_else(|| anyhow!("report_composer left final_report unset"))?
            .to_string();

        info!(
            sql_iterations = sql_loop.iterations,
            research_iterations = research_loop.iterations,
            unresolved_query_error = unresolved_query_error.is_some(),
            "research pipeline complete"
        );
        Ok(PipelineOutcome {
            sql_loop,
            research_loop,
            unresolved_query_error,
            final_report,
        })
    }

    /// Draft a plan for `user_request`, or refine the one already in state
    /// using `plan_feedback`.
    #[instrument(skip_all)]
    pub fn draft_plan(&self, state: &mut SessionState) -> Result<String> {
        self.step(PLAN_CREATOR, state)?;
        state
            .text(StateKey::ResearchPlan)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("plan_creator left research_plan unset"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::looping::LoopStop;
    use crate::core::state::StateValue;
    use crate::test_support::Harness;

    const EXECUTION_OK: &str = r#"{"action":"final","output":{"status":"success","result_table":"| region | orders |\n|---|---|\n| EU | 12 |\n"}}"#;

    fn script_sql_agent(harness: &Harness, iterations: u32) {
        harness
            .model
            .on("query_understanding", "Count orders per region last quarter.");
        harness.model.on(
            "query_generation",
            r#"{"action":"final","output":"SELECT region, COUNT(*) AS orders FROM sales.orders GROUP BY region"}"#,
        );
        for _ in 0..iterations {
            harness.model.on("query_execution", EXECUTION_OK);
            harness.model.on(
                "query_review_rewrite",
                "SELECT region, COUNT(*) AS orders FROM sales.orders GROUP BY region",
            );
        }
    }

    fn with_plan(mut state: SessionState) -> SessionState {
        state
            .write(
                StateKey::ResearchPlan,
                StateValue::Text("1. Count orders per region.".to_string()),
            )
            .expect("plan");
        state
    }

    #[test]
    fn sql_loop_spends_its_full_budget() {
        let harness = Harness::new();
        script_sql_agent(&harness, 5);
        let ctx = harness.context();
        let pipeline = Pipeline::new(&ctx, &harness.loops);
        let mut state = with_plan(harness.state());

        let outcome = pipeline.run_sql_agent(&mut state).expect("sql agent");

        assert_eq!(
            outcome.stop,
            LoopStop::MaxIterations { max_iterations: 5 }
        );
        let stages = harness.model.stages();
        assert_eq!(
            stages.iter().filter(|s| *s == "query_execution").count(),
            5
        );
        assert_eq!(harness.model.unused(), 0);
        assert!(!state.execution().expect("report").is_error());
    }

    #[test]
    fn research_requires_a_plan() {
        let harness = Harness::new();
        let ctx = harness.context();
        let pipeline = Pipeline::new(&ctx, &harness.loops);
        let mut state = harness.state();

        let err = pipeline.run_research(&mut state).unwrap_err();
        assert!(err.to_string().contains("research_plan"));
        assert!(harness.model.calls().is_empty());
    }

    #[test]
    fn state_snapshot_follows_each_iteration() {
        let mut harness = Harness::new();
        harness.loops.sql_refinement_iterations = 1;
        script_sql_agent(&harness, 1);
        let ctx = harness.context();
        let pipeline = Pipeline::new(&ctx, &harness.loops);
        let mut state = with_plan(harness.state());

        pipeline.run_sql_agent(&mut state).expect("sql agent");

        let snapshot = std::fs::read_to_string(harness.run_log.state_path()).expect("state");
        let loaded: SessionState = serde_json::from_str(&snapshot).expect("parse");
        assert_eq!(loaded, state);
        assert!(loaded.is_set(StateKey::QueryReviewRewriteOutput));
    }

    #[test]
    fn plan_refinement_sees_previous_plan_and_feedback() {
        let harness = Harness::new();
        harness.model.on(
            "plan_creator",
            r#"{"action":"final","output":"1. Count orders per region.\n2. Split by month."}"#,
        );
        let ctx = harness.context();
        let pipeline = Pipeline::new(&ctx, &harness.loops);
        let mut state = with_plan(
            harness
                .state()
                .with_plan_feedback(Some("also split by month".to_string())),
        );

        let plan = pipeline.draft_plan(&mut state).expect("plan");

        assert!(plan.contains("Split by month"));
        let prompt = &harness.model.calls()[0].request.prompt;
        assert!(prompt.contains("also split by month"));
        assert!(prompt.contains("1. Count orders per region."));
    }
}
