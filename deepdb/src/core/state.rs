//! Typed session state shared by every stage of a pipeline run.
//!
//! The state is a blackboard: each key holds only its latest value and stages
//! communicate exclusively by reading and overwriting keys. The set of keys is
//! closed ([`StateKey`]) so a misspelled reference cannot silently render as an
//! empty substitution.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::execution::ExecutionReport;
use crate::core::feedback::Feedback;

/// Every key a stage may read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    Project,
    BqLocation,
    BqDataset,
    BqConnectionId,
    UserRequest,
    PlanFeedback,
    ResearchPlan,
    QueryUnderstandingOutput,
    QueryGenerationOutput,
    QueryReviewRewriteOutput,
    QueryExecutionOutput,
    ReportSections,
    SectionResearchFindings,
    ResearchEvaluation,
    FinalRevisedReport,
    FinalReport,
}

/// Shape of the value stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    /// Text holding a single SQL statement.
    Sql,
    Execution,
    Evaluation,
}

impl StateKey {
    pub const ALL: [StateKey; 16] = [
        StateKey::Project,
        StateKey::BqLocation,
        StateKey::BqDataset,
        StateKey::BqConnectionId,
        StateKey::UserRequest,
        StateKey::PlanFeedback,
        StateKey::ResearchPlan,
        StateKey::QueryUnderstandingOutput,
        StateKey::QueryGenerationOutput,
        StateKey::QueryReviewRewriteOutput,
        StateKey::QueryExecutionOutput,
        StateKey::ReportSections,
        StateKey::SectionResearchFindings,
        StateKey::ResearchEvaluation,
        StateKey::FinalRevisedReport,
        StateKey::FinalReport,
    ];

    /// Name used in templates and state snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            StateKey::Project => "PROJECT",
            StateKey::BqLocation => "BQ_LOCATION",
            StateKey::BqDataset => "BQ_DATASET",
            StateKey::BqConnectionId => "BQ_CONNECTION_ID",
            StateKey::UserRequest => "user_request",
            StateKey::PlanFeedback => "plan_feedback",
            StateKey::ResearchPlan => "research_plan",
            StateKey::QueryUnderstandingOutput => "query_understanding_output",
            StateKey::QueryGenerationOutput => "query_generation_output",
            StateKey::QueryReviewRewriteOutput => "query_review_rewrite_output",
            StateKey::QueryExecutionOutput => "query_execution_output",
            StateKey::ReportSections => "report_sections",
            StateKey::SectionResearchFindings => "section_research_findings",
            StateKey::ResearchEvaluation => "research_evaluation",
            StateKey::FinalRevisedReport => "final_revised_report",
            StateKey::FinalReport => "final_report",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }

    /// Seed keys are set before the pipeline starts and are read-only to stages.
    pub fn is_seed(self) -> bool {
        matches!(
            self,
            StateKey::Project
                | StateKey::BqLocation
                | StateKey::BqDataset
                | StateKey::BqConnectionId
                | StateKey::UserRequest
                | StateKey::PlanFeedback
        )
    }

    pub fn kind(self) -> ValueKind {
        match self {
            StateKey::QueryGenerationOutput | StateKey::QueryReviewRewriteOutput => ValueKind::Sql,
            StateKey::QueryExecutionOutput => ValueKind::Execution,
            StateKey::ResearchEvaluation => ValueKind::Evaluation,
            _ => ValueKind::Text,
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value produced by a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Text(String),
    Execution(ExecutionReport),
    Evaluation(Feedback),
}

/// Evaluation slot contents.
///
/// Snapshots may carry an evaluation that does not match the feedback shape;
/// it is kept verbatim so the escalation check can treat it as unparsable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluationSlot {
    Parsed(Feedback),
    Unparsed(Value),
}

/// Warehouse coordinates seeded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WarehouseCoordinates {
    pub project: String,
    pub location: String,
    pub dataset: String,
    pub connection_id: Option<String>,
}

/// Session state for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(rename = "PROJECT")]
    project: String,
    #[serde(rename = "BQ_LOCATION")]
    location: String,
    #[serde(rename = "BQ_DATASET")]
    dataset: String,
    #[serde(rename = "BQ_CONNECTION_ID", default)]
    connection_id: Option<String>,
    user_request: String,
    #[serde(default)]
    plan_feedback: Option<String>,
    #[serde(default)]
    research_plan: Option<String>,
    #[serde(default)]
    query_understanding_output: Option<String>,
    #[serde(default)]
    query_generation_output: Option<String>,
    #[serde(default)]
    query_review_rewrite_output: Option<String>,
    #[serde(default)]
    query_execution_output: Option<ExecutionReport>,
    #[serde(default)]
    report_sections: Option<String>,
    #[serde(default)]
    section_research_findings: Option<String>,
    #[serde(default)]
    research_evaluation: Option<EvaluationSlot>,
    #[serde(default)]
    final_revised_report: Option<String>,
    #[serde(default)]
    final_report: Option<String>,
}

impl SessionState {
    /// Create the state at pipeline start with its seed values.
    pub fn seeded(coordinates: &WarehouseCoordinates, user_request: impl Into<String>) -> Self {
        Self {
            project: coordinates.project.clone(),
            location: coordinates.location.clone(),
            dataset: coordinates.dataset.clone(),
            connection_id: coordinates.connection_id.clone(),
            user_request: user_request.into(),
            plan_feedback: None,
            research_plan: None,
            query_understanding_output: None,
            query_generation_output: None,
            query_review_rewrite_output: None,
            query_execution_output: None,
            report_sections: None,
            section_research_findings: None,
            research_evaluation: None,
            final_revised_report: None,
            final_report: None,
        }
    }

    pub fn with_plan_feedback(mut self, feedback: Option<String>) -> Self {
        self.plan_feedback = feedback.filter(|text| !text.trim().is_empty());
        self
    }

    pub fn coordinates(&self) -> WarehouseCoordinates {
        WarehouseCoordinates {
            project: self.project.clone(),
            location: self.location.clone(),
            dataset: self.dataset.clone(),
            connection_id: self.connection_id.clone(),
        }
    }

    /// Borrow a text-valued key. Structured keys return `None`; use [`Self::get`].
    pub fn text(&self, key: StateKey) -> Option<&str> {
        let value = match key {
            StateKey::Project => Some(&self.project),
            StateKey::BqLocation => Some(&self.location),
            StateKey::BqDataset => Some(&self.dataset),
            StateKey::BqConnectionId => self.connection_id.as_ref(),
            StateKey::UserRequest => Some(&self.user_request),
            StateKey::PlanFeedback => self.plan_feedback.as_ref(),
            StateKey::ResearchPlan => self.research_plan.as_ref(),
            StateKey::QueryUnderstandingOutput => self.query_understanding_output.as_ref(),
            StateKey::QueryGenerationOutput => self.query_generation_output.as_ref(),
            StateKey::QueryReviewRewriteOutput => self.query_review_rewrite_output.as_ref(),
            StateKey::ReportSections => self.report_sections.as_ref(),
            StateKey::SectionResearchFindings => self.section_research_findings.as_ref(),
            StateKey::FinalRevisedReport => self.final_revised_report.as_ref(),
            StateKey::FinalReport => self.final_report.as_ref(),
            StateKey::QueryExecutionOutput | StateKey::ResearchEvaluation => None,
        };
        value.map(String::as_str)
    }

    pub fn execution(&self) -> Option<&ExecutionReport> {
        self.query_execution_output.as_ref()
    }

    pub fn evaluation(&self) -> Option<&EvaluationSlot> {
        self.research_evaluation.as_ref()
    }

    pub fn is_set(&self, key: StateKey) -> bool {
        match key {
            StateKey::QueryExecutionOutput => self.query_execution_output.is_some(),
            StateKey::ResearchEvaluation => self.research_evaluation.is_some(),
            _ => self.text(key).is_some(),
        }
    }

    /// Read any key in its rendered text form.
    pub fn get(&self, key: StateKey) -> Option<String> {
        match key {
            StateKey::QueryExecutionOutput => self.query_execution_output.as_ref().map(|r| r.render()),
            StateKey::ResearchEvaluation => self.research_evaluation.as_ref().map(render_evaluation),
            _ => self.text(key).map(str::to_string),
        }
    }

    /// The SQL the next execution should run: the latest rewrite when one
    /// exists, otherwise the originally generated query.
    pub fn current_query(&self) -> Option<&str> {
        self.query_review_rewrite_output
            .as_deref()
            .filter(|sql| !sql.trim().is_empty())
            .or(self.query_generation_output.as_deref())
    }

    /// Overwrite `key` with `value`.
    ///
    /// Seed keys are immutable and each key only accepts its own value kind.
    pub fn write(&mut self, key: StateKey, value: StateValue) -> Result<()> {
        if key.is_seed() {
            bail!("{key} is a seed value and cannot be written by a stage");
        }
        match (key.kind(), value) {
            (ValueKind::Execution, StateValue::Execution(report)) => {
                self.query_execution_output = Some(report);
            }
            (ValueKind::Evaluation, StateValue::Evaluation(feedback)) => {
                self.research_evaluation = Some(EvaluationSlot::Parsed(feedback));
            }
            (ValueKind::Text | ValueKind::Sql, StateValue::Text(text)) => {
                let slot = match key {
                    StateKey::ResearchPlan => &mut self.research_plan,
                    StateKey::QueryUnderstandingOutput => &mut self.query_understanding_output,
                    StateKey::QueryGenerationOutput => &mut self.query_generation_output,
                    StateKey::QueryReviewRewriteOutput => &mut self.query_review_rewrite_output,
                    StateKey::ReportSections => &mut self.report_sections,
                    StateKey::SectionResearchFindings => &mut self.section_research_findings,
                    StateKey::FinalRevisedReport => &mut self.final_revised_report,
                    StateKey::FinalReport => &mut self.final_report,
                    other => bail!("{other} is not a text key"),
                };
                *slot = Some(text);
            }
            (kind, value) => {
                bail!(
                    "{key} expects a {kind:?} value, got {}",
                    value_kind_name(&value)
                );
            }
        }
        Ok(())
    }

    /// All present keys in rendered form, for template substitution.
    ///
    /// Absent keys are omitted so templates see them as undefined (empty).
    pub fn render_context(&self) -> Map<String, Value> {
        StateKey::ALL
            .into_iter()
            .filter_map(|key| {
                self.get(key)
                    .map(|value| (key.as_str().to_string(), Value::String(value)))
            })
            .collect()
    }
}

fn render_evaluation(slot: &EvaluationSlot) -> String {
    let value = match slot {
        EvaluationSlot::Parsed(feedback) => serde_json::to_value(feedback).unwrap_or(Value::Null),
        EvaluationSlot::Unparsed(raw) => raw.clone(),
    };
    serde_json::to_string_pretty(&value).unwrap_or_default()
}

fn value_kind_name(value: &StateValue) -> &'static str {
    match value {
        StateValue::Text(_) => "text",
        StateValue::Execution(_) => "execution report",
        StateValue::Evaluation(_) => "feedback record",
    }
}
