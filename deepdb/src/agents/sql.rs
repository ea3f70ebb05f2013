//! Stages of the SQL agent.

use crate::agents::model_stage::{ModelRole, StageSpec, Toolset};
use crate::core::state::StateKey;

/// Restates the request as a precise data question.
pub const QUERY_UNDERSTANDING: StageSpec = StageSpec {
    name: "query_understanding",
    role: ModelRole::Critic,
    template: "query_understanding",
    required: &[StateKey::ResearchPlan],
    output_key: StateKey::QueryUnderstandingOutput,
    toolset: Toolset::None,
};

/// Drafts the first SQL statement, looking up table metadata as needed.
pub const QUERY_GENERATION: StageSpec = StageSpec {
    name: "query_generation",
    role: ModelRole::Worker,
    template: "query_generation",
    required: &[StateKey::QueryUnderstandingOutput],
    output_key: StateKey::QueryGenerationOutput,
    toolset: Toolset::Metadata,
};

/// Runs the current query unchanged and reports rows or a structured error.
pub const QUERY_EXECUTION: StageSpec = StageSpec {
    name: "query_execution",
    role: ModelRole::Worker,
    template: "query_execution",
    required: &[StateKey::QueryGenerationOutput],
    output_key: StateKey::QueryExecutionOutput,
    toolset: Toolset::Full,
};

pub const QUERY_REVIEW_REWRITE: StageSpec = StageSpec {
    name: "query_review_rewrite",
    role: ModelRole::Critic,
    template: "query_review_rewrite",
    required: &[StateKey::QueryGenerationOutput, StateKey::QueryExecutionOutput],
    output_key: StateKey::QueryReviewRewriteOutput,
    toolset: Toolset::None,
};

pub const STAGES: [StageSpec; 4] = [
    QUERY_UNDERSTANDING,
    QUERY_GENERATION,
    QUERY_EXECUTION,
    QUERY_REVIEW_REWRITE,
];
