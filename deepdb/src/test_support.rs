//! Test-only helpers: fixtures plus scripted model and warehouse backends.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::agents::model_stage::StageContext;
use crate::core::execution::QueryResult;
use crate::core::feedback::{Correction, Feedback, Grade, IssueType};
use crate::core::state::{SessionState, WarehouseCoordinates};
use crate::io::config::{LoopConfig, ModelConfig};
use crate::io::model::{ExecRequest, ModelExecutor};
use crate::io::prompt::PromptEngine;
use crate::io::run_log::RunLog;
use crate::io::warehouse::Warehouse;

pub const USER_REQUEST: &str = "How did order volume change by region last quarter?";

pub fn coordinates() -> WarehouseCoordinates {
    WarehouseCoordinates {
        project: "test-project".to_string(),
        location: "us-east1".to_string(),
        dataset: "sales".to_string(),
        connection_id: None,
    }
}

pub fn passing_feedback() -> Feedback {
    Feedback {
        grade: Grade::Pass,
        comment: "All statements are supported by the query result.".to_string(),
        corrections_needed: None,
    }
}

pub fn failing_feedback(corrections: Vec<Correction>) -> Feedback {
    Feedback {
        grade: Grade::Fail,
        comment: "Some statements are not supported.".to_string(),
        corrections_needed: Some(corrections),
    }
}

pub fn correction(section: &str, issue_type: IssueType) -> Correction {
    Correction {
        section_identifier: section.to_string(),
        problematic_content: format!("claim in {section}"),
        issue_type,
        correction_instruction: "restate using the query result".to_string(),
    }
}

/// A model call observed by [`ScriptedModel`].
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub stage: String,
    pub request: ExecRequest,
}

enum ScriptedReply {
    Text(String),
    Fail(String),
}

/// Model backend that answers from per-stage reply queues.
///
/// The stage is recovered from the `NNN-<stage>` run directory the request
/// writes into.
#[derive(Default)]
pub struct ScriptedModel {
    replies: RefCell<HashMap<String, VecDeque<ScriptedReply>>>,
    calls: RefCell<Vec<ScriptedCall>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next turn of `stage`.
    pub fn on(&self, stage: &str, reply: &str) {
        self.push(stage, ScriptedReply::Text(reply.to_string()));
    }

    /// Make the next turn of `stage` fail.
    pub fn fail_on(&self, stage: &str, message: &str) {
        self.push(stage, ScriptedReply::Fail(message.to_string()));
    }

    fn push(&self, stage: &str, reply: ScriptedReply) {
        self.replies
            .borrow_mut()
            .entry(stage.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.borrow().clone()
    }

    /// Stage names in call order.
    pub fn stages(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|call| call.stage.clone()).collect()
    }

    /// Replies queued but never consumed.
    pub fn unused(&self) -> usize {
        self.replies.borrow().values().map(VecDeque::len).sum()
    }
}

fn stage_of(request: &ExecRequest) -> Result<String> {
    let dir = request
        .output_path
        .parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("output path {} has no stage dir", request.output_path.display()))?;
    let (_, stage) = dir
        .split_once('-')
        .ok_or_else(|| anyhow!("unexpected stage dir {dir}"))?;
    Ok(stage.to_string())
}

impl ModelExecutor for ScriptedModel {
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        let stage = stage_of(request)?;
        self.calls.borrow_mut().push(ScriptedCall {
            stage: stage.clone(),
            request: request.clone(),
        });
        let reply = self
            .replies
            .borrow_mut()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(ScriptedReply::Text(text)) => {
                fs::write(&request.output_path, text)?;
                Ok(())
            }
            Some(ScriptedReply::Fail(message)) => Err(anyhow!(message)),
            None => bail!("no scripted reply left for stage {stage}"),
        }
    }
}

/// Warehouse returning queued results and fixed table metadata.
#[derive(Default)]
pub struct ScriptedWarehouse {
    results: RefCell<VecDeque<QueryResult>>,
    datasets: BTreeMap<String, Value>,
    tables: BTreeMap<String, Value>,
    executed: RefCell<Vec<String>>,
}

impl ScriptedWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, result: QueryResult) -> Self {
        self.results.borrow_mut().push_back(result);
        self
    }

    pub fn with_dataset(mut self, dataset_id: &str, info: Value) -> Self {
        self.datasets.insert(dataset_id.to_string(), info);
        self
    }

    pub fn with_table(mut self, table_id: &str, info: Value) -> Self {
        self.tables.insert(table_id.to_string(), info);
        self
    }

    /// Statements that reached the warehouse, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.borrow().clone()
    }
}

impl Warehouse for ScriptedWarehouse {
    fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        self.executed.borrow_mut().push(sql.to_string());
        self.results
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted result left for {sql:?}"))
    }

    fn list_dataset_ids(&self) -> Result<Vec<String>> {
        Ok(self.datasets.keys().cloned().collect())
    }

    fn get_dataset_info(&self, dataset_id: &str) -> Result<Option<Value>> {
        Ok(self.datasets.get(dataset_id).cloned())
    }

    fn list_table_ids(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn get_table_info(&self, table_id: &str) -> Result<Option<Value>> {
        Ok(self.tables.get(table_id).cloned())
    }
}

/// Everything a stage needs, backed by scripted collaborators and a temp dir.
pub struct Harness {
    pub temp: TempDir,
    pub model: ScriptedModel,
    pub warehouse: ScriptedWarehouse,
    pub prompts: PromptEngine,
    pub run_log: RunLog,
    pub models: ModelConfig,
    pub loops: LoopConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(ScriptedWarehouse::new(), ModelConfig::default().max_tool_calls)
    }

    pub fn with_warehouse(warehouse: ScriptedWarehouse) -> Self {
        Self::build(warehouse, ModelConfig::default().max_tool_calls)
    }

    pub fn with_limits(max_tool_calls: u32) -> Self {
        Self::build(ScriptedWarehouse::new(), max_tool_calls)
    }

    fn build(warehouse: ScriptedWarehouse, max_tool_calls: u32) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_log = RunLog::create(temp.path()).expect("run log");
        let models = ModelConfig {
            critic_model: "critic-model".to_string(),
            worker_model: "worker-model".to_string(),
            max_tool_calls,
            ..ModelConfig::default()
        };
        Self {
            prompts: PromptEngine::new(models.prompt_budget_bytes).expect("prompt engine"),
            temp,
            model: ScriptedModel::new(),
            warehouse,
            run_log,
            models,
            loops: LoopConfig::default(),
        }
    }

    pub fn context(&self) -> StageContext<'_> {
        StageContext {
            executor: &self.model,
            warehouse: &self.warehouse,
            prompts: &self.prompts,
            run_log: &self.run_log,
            models: &self.models,
            workdir: self.temp.path().to_path_buf(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::seeded(&coordinates(), USER_REQUEST)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
