//! Planning and report stages.

use crate::agents::model_stage::{ModelRole, StageSpec, Toolset};
use crate::core::state::StateKey;

/// Drafts or refines the research plan shown to the user for approval.
pub const PLAN_CREATOR: StageSpec = StageSpec {
    name: "plan_creator",
    role: ModelRole::Worker,
    template: "plan_creator",
    required: &[StateKey::UserRequest],
    output_key: StateKey::ResearchPlan,
    toolset: Toolset::Metadata,
};

pub const REPORT_STRUCTURE_PLANNER: StageSpec = StageSpec {
    name: "report_structure_planner",
    role: ModelRole::Worker,
    template: "report_structure_planner",
    required: &[StateKey::ResearchPlan],
    output_key: StateKey::ReportSections,
    toolset: Toolset::None,
};

/// Writes findings per section from the query result.
pub const SECTION_RESEARCH: StageSpec = StageSpec {
    name: "section_research",
    role: ModelRole::Worker,
    template: "section_research",
    required: &[StateKey::ReportSections, StateKey::QueryExecutionOutput],
    output_key: StateKey::SectionResearchFindings,
    toolset: Toolset::None,
};

/// Fact-checks the report against the query result.
pub const RESEARCH_EVALUATOR: StageSpec = StageSpec {
    name: "research_evaluator",
    role: ModelRole::Critic,
    template: "research_evaluator",
    required: &[StateKey::SectionResearchFindings, StateKey::QueryExecutionOutput],
    output_key: StateKey::ResearchEvaluation,
    toolset: Toolset::None,
};

pub const REPORT_REVISION: StageSpec = StageSpec {
    name: "report_revision",
    role: ModelRole::Worker,
    template: "report_revision",
    required: &[StateKey::ResearchEvaluation, StateKey::SectionResearchFindings],
    output_key: StateKey::FinalRevisedReport,
    toolset: Toolset::None,
};

pub const REPORT_COMPOSER: StageSpec = StageSpec {
    name: "report_composer",
    role: ModelRole::Critic,
    template: "report_composer",
    required: &[StateKey::ReportSections, StateKey::SectionResearchFindings],
    output_key: StateKey::FinalReport,
    toolset: Toolset::None,
};

pub const STAGES: [StageSpec; 6] = [
    PLAN_CREATOR,
    REPORT_STRUCTURE_PLANNER,
    SECTION_RESEARCH,
    RESEARCH_EVALUATOR,
    REPORT_REVISION,
    REPORT_COMPOSER,
];
