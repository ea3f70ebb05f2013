//! Warehouse collaborator backed by the `bq` command-line client.
//!
//! Rejections of a statement by the warehouse come back as
//! [`QueryResult::Error`] so the SQL loop can correct them. Failures to reach
//! the warehouse at all (spawn errors, timeouts, unreadable output) are `Err`.

use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::execution::{QueryError, QueryResult, QueryRows};
use crate::core::sql::fragment_at;
use crate::io::config::WarehouseConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

static BQ_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)(?:BigQuery error in \w+ operation|Error in query string):\s*(?:Error processing job '[^']*':\s*)?(.*)",
    )
    .unwrap()
});
static POSITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"at \[(\d+):(\d+)\]").unwrap());
static TABLE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-$]+$").unwrap());
static DATASET_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Read-only access to the configured project and dataset.
pub trait Warehouse {
    /// Run one statement. Warehouse rejections are `Ok(QueryResult::Error)`.
    fn execute_sql(&self, sql: &str) -> Result<QueryResult>;

    /// Dataset ids in the configured project.
    fn list_dataset_ids(&self) -> Result<Vec<String>>;

    /// Metadata for one dataset of the project; `None` if it does not exist.
    fn get_dataset_info(&self, dataset_id: &str) -> Result<Option<Value>>;

    /// Table ids in the configured dataset.
    fn list_table_ids(&self) -> Result<Vec<String>>;

    /// Schema and metadata for one table; `None` if the table does not exist.
    fn get_table_info(&self, table_id: &str) -> Result<Option<Value>>;
}

/// [`Warehouse`] that shells out to `bq`.
pub struct BqCliWarehouse {
    command: Vec<String>,
    project: String,
    location: String,
    dataset: String,
    max_rows: u32,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl BqCliWarehouse {
    pub fn from_config(cfg: &WarehouseConfig) -> Result<Self> {
        let project = cfg
            .project
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| anyhow!("warehouse.project is not set"))?;
        if cfg.command.first().is_none_or(|p| p.trim().is_empty()) {
            bail!("warehouse.command must name a program");
        }
        Ok(Self {
            command: cfg.command.clone(),
            project,
            location: cfg.location.clone(),
            dataset: cfg.dataset.clone(),
            max_rows: cfg.max_rows,
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        })
    }

    fn dataset_ref(&self) -> String {
        format!("{}:{}", self.project, self.dataset)
    }

    fn base_command(&self) -> Result<Command> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("warehouse command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg(format!("--project_id={}", self.project))
            .arg(format!("--location={}", self.location))
            .arg("--format=json")
            .arg("--quiet");
        Ok(cmd)
    }

    fn run(&self, cmd: Command, operation: &str) -> Result<CommandOutput> {
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run bq {operation}"))?;
        if output.timed_out {
            bail!("bq {operation} timed out after {:?}", self.timeout);
        }
        if output.stdout_truncated > 0 {
            bail!(
                "bq {operation} output exceeded {} bytes",
                self.output_limit_bytes
            );
        }
        Ok(output)
    }
}

impl Warehouse for BqCliWarehouse {
    #[instrument(skip_all, fields(dataset = %self.dataset, max_rows = self.max_rows))]
    fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let mut cmd = self.base_command()?;
        cmd.arg(format!("--dataset_id={}", self.dataset_ref()))
            .arg("query")
            .arg("--nouse_legacy_sql")
            .arg(format!("--max_rows={}", self.max_rows))
            .arg(sql);
        let output = self.run(cmd, "query")?;

        if !output.status.success() {
            let text = failure_text(&output);
            return match classify_bq_error(&text, sql) {
                Some(error) => {
                    info!(error_type = %error.error_type, "warehouse rejected query");
                    Ok(QueryResult::Error(error))
                }
                None => {
                    warn!(exit_code = ?output.status.code(), "bq query failed");
                    Err(anyhow!("bq query failed: {}", text.trim()))
                }
            };
        }

        let rows = parse_rows(&output.stdout_text()).context("parse bq query output")?;
        debug!(rows = rows.rows.len(), "query succeeded");
        Ok(QueryResult::Success(rows))
    }

    #[instrument(skip_all, fields(project = %self.project))]
    fn list_dataset_ids(&self) -> Result<Vec<String>> {
        let mut cmd = self.base_command()?;
        cmd.arg("ls")
            .arg("--datasets")
            .arg("--max_results=10000")
            .arg(format!("{}:", self.project));
        let output = self.run(cmd, "ls")?;
        if !output.status.success() {
            bail!("bq ls --datasets failed: {}", failure_text(&output).trim());
        }
        parse_dataset_ids(&output.stdout_text()).context("parse bq ls output")
    }

    #[instrument(skip_all, fields(dataset_id = %dataset_id))]
    fn get_dataset_info(&self, dataset_id: &str) -> Result<Option<Value>> {
        if !DATASET_ID_RE.is_match(dataset_id) {
            debug!("not a plain dataset id, treating as missing");
            return Ok(None);
        }
        let mut cmd = self.base_command()?;
        cmd.arg("show")
            .arg(format!("{}:{dataset_id}", self.project));
        let output = self.run(cmd, "show")?;
        if !output.status.success() {
            let text = failure_text(&output);
            if text.contains("Not found") {
                return Ok(None);
            }
            bail!("bq show failed: {}", text.trim());
        }
        let raw: Value =
            serde_json::from_str(&output.stdout_text()).context("parse bq show output")?;
        Ok(Some(summarize(&raw, DATASET_FIELDS)))
    }

    #[instrument(skip_all, fields(dataset = %self.dataset))]
    fn list_table_ids(&self) -> Result<Vec<String>> {
        let mut cmd = self.base_command()?;
        cmd.arg("ls")
            .arg("--max_results=10000")
            .arg(self.dataset_ref());
        let output = self.run(cmd, "ls")?;
        if !output.status.success() {
            bail!("bq ls failed: {}", failure_text(&output).trim());
        }
        parse_table_ids(&output.stdout_text()).context("parse bq ls output")
    }

    #[instrument(skip_all, fields(table_id = %table_id))]
    fn get_table_info(&self, table_id: &str) -> Result<Option<Value>> {
        if !TABLE_ID_RE.is_match(table_id) {
            debug!("not a plain table id, treating as missing");
            return Ok(None);
        }
        let mut cmd = self.base_command()?;
        cmd.arg("show")
            .arg("--schema=false")
            .arg(format!("{}.{table_id}", self.dataset_ref()));
        let output = self.run(cmd, "show")?;
        if !output.status.success() {
            let text = failure_text(&output);
            if text.contains("Not found") {
                return Ok(None);
            }
            bail!("bq show failed: {}", text.trim());
        }
        let raw: Value =
            serde_json::from_str(&output.stdout_text()).context("parse bq show output")?;
        Ok(Some(summarize(&raw, TABLE_FIELDS)))
    }
}

/// bq reports errors on stdout or stderr depending on the subcommand.
fn failure_text(output: &CommandOutput) -> String {
    let stdout = output.stdout_text();
    let stderr = output.stderr_text();
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{stdout}\n{stderr}"),
        (true, _) => stderr,
        (false, true) => stdout,
    }
}

/// Turn bq failure text into a structured error, or `None` when the failure
/// is not a statement rejection.
pub fn classify_bq_error(text: &str, sql: &str) -> Option<QueryError> {
    let message = BQ_ERROR_RE.captures(text)?.get(1)?.as_str().trim();
    let message = message.lines().next().unwrap_or(message).trim().to_string();
    if message.is_empty() {
        return None;
    }

    let lowered = message.to_ascii_lowercase();
    let error_type = if lowered.contains("syntax error") {
        "syntax_error"
    } else if lowered.contains("not found") || lowered.contains("unrecognized name") {
        "not_found"
    } else if lowered.contains("no matching signature")
        || lowered.contains("cannot be coerced")
        || lowered.contains("type mismatch")
    {
        "type_mismatch"
    } else if lowered.contains("access denied") || lowered.contains("permission") {
        "access_denied"
    } else {
        "query_error"
    };

    let fragment = POSITION_RE.captures(&message).and_then(|caps| {
        let line = caps[1].parse().ok()?;
        let column = caps[2].parse().ok()?;
        fragment_at(sql, line, column)
    });

    Some(QueryError {
        error_type: error_type.to_string(),
        message,
        fragment,
    })
}

/// Parse `bq --format=json query` output (array of row objects).
pub fn parse_rows(stdout: &str) -> Result<QueryRows> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(QueryRows::default());
    }
    let value: Value = serde_json::from_str(trimmed).context("decode rows json")?;
    let records = value
        .as_array()
        .ok_or_else(|| anyhow!("expected a json array of rows"))?;

    let mut columns: Vec<String> = Vec::new();
    for record in records {
        let object = record
            .as_object()
            .ok_or_else(|| anyhow!("expected each row to be a json object"))?;
        for key in object.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }

    let rows = records
        .iter()
        .filter_map(Value::as_object)
        .map(|object| columns.iter().map(|c| cell_text(object.get(c))).collect())
        .collect();
    Ok(QueryRows { columns, rows })
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// Parse `bq --format=json ls` output for a dataset.
pub fn parse_table_ids(stdout: &str) -> Result<Vec<String>> {
    parse_ids(stdout, "/tableReference/tableId")
}

/// Parse `bq --format=json ls --datasets` output.
pub fn parse_dataset_ids(stdout: &str) -> Result<Vec<String>> {
    parse_ids(stdout, "/datasetReference/datasetId")
}

fn parse_ids(stdout: &str, pointer: &str) -> Result<Vec<String>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).context("decode ls json")?;
    let entries = value
        .as_array()
        .ok_or_else(|| anyhow!("expected a json array of entries"))?;
    let mut ids: Vec<String> = entries
        .iter()
        .filter_map(|entry| entry.pointer(pointer)?.as_str())
        .map(str::to_string)
        .collect();
    ids.sort();
    Ok(ids)
}

const TABLE_FIELDS: &[&str] = &["tableReference", "type", "description", "numRows", "schema"];
const DATASET_FIELDS: &[&str] = &["datasetReference", "description", "location", "labels"];

/// Keep the parts of `bq show` output a model needs to write SQL.
fn summarize(raw: &Value, fields: &[&str]) -> Value {
    let mut summary = Map::new();
    for key in fields {
        if let Some(value) = raw.get(*key) {
            summary.insert((*key).to_string(), value.clone());
        }
    }
    Value::Object(summary)
}
