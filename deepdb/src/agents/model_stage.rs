//! Generative stage: render a prompt, call a model, write one state key.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::execution::ExecutionReport;
use crate::core::feedback::Feedback;
use crate::core::sql::{extract_sql, strip_code_fence};
use crate::core::stage::{Stage, StageSignal};
use crate::core::state::{SessionState, StateKey, StateValue, ValueKind};
use crate::io::config::ModelConfig;
use crate::io::model::{ExecRequest, ModelExecutor, invoke_and_load};
use crate::io::prompt::{PromptEngine, ToolExchange, ToolTurn};
use crate::io::run_log::{RunLog, StageMeta, StagePaths, write_stage_meta, write_text};
use crate::io::schema::{
    OutputSchema, parse_validated, tool_envelope_schema, validate_schema, validate_value,
};
use crate::io::tools::ToolBox;
use crate::io::warehouse::Warehouse;

/// Which configured model a stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Critic,
    Worker,
}

/// Warehouse tools bound to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolset {
    None,
    /// Dataset and table lookups.
    Metadata,
    /// Metadata plus `execute_sql`.
    Full,
}

impl Toolset {
    /// Tools for this set over `warehouse`; `None` for stages without tools.
    pub fn bind<'w>(self, warehouse: &'w dyn Warehouse) -> Option<ToolBox<'w>> {
        match self {
            Toolset::None => None,
            Toolset::Metadata => Some(ToolBox::metadata(warehouse)),
            Toolset::Full => Some(ToolBox::full(warehouse)),
        }
    }
}

/// Static description of a generative stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub name: &'static str,
    pub role: ModelRole,
    pub template: &'static str,
    /// Keys that must be set before the stage runs.
    pub required: &'static [StateKey],
    pub output_key: StateKey,
    pub toolset: Toolset,
}

/// Collaborators shared by every model stage of a run.
pub struct StageContext<'a> {
    pub executor: &'a dyn ModelExecutor,
    pub warehouse: &'a dyn Warehouse,
    pub prompts: &'a PromptEngine,
    pub run_log: &'a RunLog,
    pub models: &'a ModelConfig,
    pub workdir: PathBuf,
}

/// One turn of a tool-enabled stage.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum TurnReply {
    CallTool {
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    Final {
        output: Value,
    },
}

#[derive(Debug, Default)]
struct Usage {
    turns: u32,
    tool_calls: u32,
}

/// [`Stage`] backed by a model call.
pub struct ModelStage<'a> {
    spec: StageSpec,
    ctx: &'a StageContext<'a>,
}

impl<'a> ModelStage<'a> {
    pub fn new(spec: StageSpec, ctx: &'a StageContext<'a>) -> Self {
        Self { spec, ctx }
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    fn model(&self) -> &str {
        match self.spec.role {
            ModelRole::Critic => &self.ctx.models.critic_model,
            ModelRole::Worker => &self.ctx.models.worker_model,
        }
    }

    fn check_required(&self, state: &SessionState) -> Result<()> {
        let missing: Vec<&str> = self
            .spec
            .required
            .iter()
            .filter(|key| !state.is_set(**key))
            .map(|key| key.as_str())
            .collect();
        if !missing.is_empty() {
            bail!(
                "stage {} requires state keys that are not set: {}",
                self.spec.name,
                missing.join(", ")
            );
        }
        Ok(())
    }

    fn generate(
        &self,
        state: &SessionState,
        paths: &StagePaths,
        usage: &mut Usage,
    ) -> Result<StateValue> {
        self.check_required(state)?;
        let deadline = Instant::now() + Duration::from_secs(self.ctx.models.timeout_secs);

        let Some(tools) = self.spec.toolset.bind(self.ctx.warehouse) else {
            let schema_path = match OutputSchema::for_key(self.spec.output_key) {
                Some(schema) => Some(schema.write_to(&paths.dir)?),
                None => None,
            };
            let prompt = self.ctx.prompts.render(self.spec.template, state, None)?;
            usage.turns = 1;
            let reply = self.turn(paths, 1, prompt, schema_path, deadline)?;
            return self.parse_reply(&reply);
        };

        let specs = tools.specs();
        let max_calls = self.ctx.models.max_tool_calls;
        let envelope = tool_envelope_schema();
        let mut transcript: Vec<ToolExchange> = Vec::new();
        loop {
            let turn = usage.turns + 1;
            let prompt = self.ctx.prompts.render(
                self.spec.template,
                state,
                Some(ToolTurn {
                    specs: &specs,
                    transcript: &transcript,
                    remaining_calls: max_calls.saturating_sub(usage.tool_calls),
                }),
            )?;
            usage.turns = turn;
            let reply = self.turn(paths, turn, prompt, None, deadline)?;

            let value: Value = serde_json::from_str(strip_code_fence(&reply))
                .with_context(|| format!("stage {} turn {turn}: reply is not json", self.spec.name))?;
            validate_schema(&value, &envelope)
                .with_context(|| format!("stage {} turn {turn}: invalid tool exchange reply", self.spec.name))?;
            match serde_json::from_value::<TurnReply>(value)? {
                TurnReply::Final { output } => return self.parse_final(output),
                TurnReply::CallTool { tool, arguments } => {
                    if usage.tool_calls >= max_calls {
                        bail!(
                            "stage {} exceeded its limit of {max_calls} tool calls",
                            self.spec.name
                        );
                    }
                    debug!(turn, tool = %tool, "dispatching tool call");
                    let reply = tools.dispatch(&tool, &arguments)?;
                    usage.tool_calls += 1;
                    transcript.push(ToolExchange {
                        tool,
                        arguments,
                        reply,
                    });
                }
            }
        }
    }

    fn turn(
        &self,
        paths: &StagePaths,
        turn: u32,
        prompt: String,
        output_schema_path: Option<PathBuf>,
        deadline: Instant,
    ) -> Result<String> {
        write_text(&paths.prompt_path(turn), &prompt)?;
        let request = ExecRequest {
            workdir: self.ctx.workdir.clone(),
            model: self.model().to_string(),
            prompt,
            output_schema_path,
            output_path: paths.output_path(turn),
            log_path: paths.log_path(turn),
            timeout: remaining_budget(deadline, self.spec.name)?,
            output_limit_bytes: self.ctx.models.output_limit_bytes,
        };
        invoke_and_load(self.ctx.executor, &request)
            .with_context(|| format!("stage {} turn {turn}: model call failed", self.spec.name))
    }

    /// Convert a plain reply into the output key's value kind.
    fn parse_reply(&self, reply: &str) -> Result<StateValue> {
        let name = self.spec.name;
        match self.spec.output_key.kind() {
            ValueKind::Text => {
                let text = reply.trim();
                if text.is_empty() {
                    bail!("stage {name} produced an empty reply");
                }
                Ok(StateValue::Text(text.to_string()))
            }
            ValueKind::Sql => {
                let sql = extract_sql(reply);
                if sql.is_empty() {
                    bail!("stage {name} produced no SQL");
                }
                Ok(StateValue::Text(sql))
            }
            ValueKind::Execution => {
                let report: ExecutionReport = parse_validated(reply, OutputSchema::ExecutionReport)
                    .with_context(|| format!("stage {name}: invalid execution report"))?;
                Ok(StateValue::Execution(report))
            }
            ValueKind::Evaluation => {
                let feedback: Feedback = parse_validated(reply, OutputSchema::Feedback)
                    .with_context(|| format!("stage {name}: invalid feedback record"))?;
                Ok(StateValue::Evaluation(feedback))
            }
        }
    }

    /// Convert the `output` of a final tool-exchange turn.
    fn parse_final(&self, output: Value) -> Result<StateValue> {
        let name = self.spec.name;
        match (OutputSchema::for_key(self.spec.output_key), output) {
            (Some(OutputSchema::ExecutionReport), output) => {
                let report: ExecutionReport =
                    validate_value(output, OutputSchema::ExecutionReport)
                        .with_context(|| format!("stage {name}: invalid execution report"))?;
                Ok(StateValue::Execution(report))
            }
            (Some(OutputSchema::Feedback), output) => {
                let feedback: Feedback = validate_value(output, OutputSchema::Feedback)
                    .with_context(|| format!("stage {name}: invalid feedback record"))?;
                Ok(StateValue::Evaluation(feedback))
            }
            (None, Value::String(text)) => self.parse_reply(&text),
            (None, other) => Err(anyhow!(
                "stage {name}: final output must be a string, got {}",
                json_type(&other)
            )),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

impl Stage for ModelStage<'_> {
    fn name(&self) -> &str {
        self.spec.name
    }

    #[instrument(skip_all, fields(stage = self.spec.name, output_key = %self.spec.output_key))]
    fn run(&self, state: &mut SessionState) -> Result<StageSignal> {
        let paths = self.ctx.run_log.stage_dir(self.spec.name)?;
        let started_at = Utc::now();
        let start = Instant::now();
        let mut usage = Usage::default();

        let result = self.generate(state, &paths, &mut usage);

        let meta = StageMeta {
            stage: self.spec.name.to_string(),
            model: self.model().to_string(),
            output_key: self.spec.output_key.as_str().to_string(),
            turns: usage.turns,
            tool_calls: usage.tool_calls,
            started_at: started_at.to_rfc3339(),
            ended_at: Utc::now().to_rfc3339(),
            duration_ms: millis(start.elapsed()),
            ok: result.is_ok(),
            error: result.as_ref().err().map(|err| format!("{err:#}")),
        };
        write_stage_meta(&paths, &meta)?;

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "stage failed");
                return Err(err);
            }
        };
        state.write(self.spec.output_key, value)?;
        info!(
            turns = usage.turns,
            tool_calls = usage.tool_calls,
            "stage completed"
        );
        Ok(StageSignal::Continue)
    }
}
