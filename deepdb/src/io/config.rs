//! Pipeline configuration stored under `.deepdb/config.toml`.
//!
//! The file is optional; missing fields take defaults. Environment variables
//! from the deployment (`GOOGLE_CLOUD_PROJECT`, `CRITIC_MODEL`, ...) are
//! applied on top of the file before validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::state::WarehouseCoordinates;

/// Pipeline configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DeepdbConfig {
    pub warehouse: WarehouseConfig,
    pub models: ModelConfig,
    pub loops: LoopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Google Cloud project that owns the dataset and pays for queries.
    pub project: Option<String>,
    pub location: String,
    pub dataset: String,
    /// BigQuery connection used by AI functions inside generated SQL.
    pub connection_id: Option<String>,
    /// Row cap applied to every executed query.
    pub max_rows: u32,
    /// Warehouse CLI program and leading arguments.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project: None,
            location: "us-east1".to_string(),
            dataset: "kaggle_BQ_AI".to_string(),
            connection_id: None,
            max_rows: 1000,
            command: vec!["bq".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 5_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Model used for review, evaluation and composition.
    pub critic_model: String,
    /// Model used for planning, generation, execution and revision.
    pub worker_model: String,
    /// Model CLI program and leading arguments.
    pub command: Vec<String>,
    /// Wall-clock budget per stage (all turns and tool calls).
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Tool calls a single stage may make before it must answer.
    pub max_tool_calls: u32,
    /// Maximum bytes of a rendered prompt before sections are dropped.
    pub prompt_budget_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            critic_model: "gemini-2.5-pro".to_string(),
            worker_model: "gemini-2.5-flash".to_string(),
            command: vec!["codex".to_string(), "exec".to_string()],
            timeout_secs: 15 * 60,
            output_limit_bytes: 200_000,
            max_tool_calls: 8,
            prompt_budget_bytes: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Iterations of the evaluate/revise loop.
    pub max_feedback_iterations: u32,
    /// Iterations of the execute/review SQL loop.
    pub sql_refinement_iterations: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_feedback_iterations: 2,
            sql_refinement_iterations: 5,
        }
    }
}

impl DeepdbConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self
            .warehouse
            .project
            .as_deref()
            .is_none_or(|p| p.trim().is_empty())
        {
            errors.push("warehouse.project is required (set GOOGLE_CLOUD_PROJECT or GCP_PROJECT_ID)");
        }
        if self.warehouse.location.trim().is_empty() {
            errors.push("warehouse.location is required (set GOOGLE_CLOUD_LOCATION)");
        }
        if self.warehouse.dataset.trim().is_empty() {
            errors.push("warehouse.dataset is required (set GOOGLE_BQ_DATASET)");
        }
        if self.warehouse.max_rows == 0 {
            errors.push("warehouse.max_rows must be > 0");
        }
        if self.warehouse.timeout_secs == 0 || self.models.timeout_secs == 0 {
            errors.push("timeout_secs must be > 0");
        }
        if self.warehouse.output_limit_bytes == 0 || self.models.output_limit_bytes == 0 {
            errors.push("output_limit_bytes must be > 0");
        }
        if !command_is_set(&self.warehouse.command) {
            errors.push("warehouse.command must be a non-empty array");
        }
        if !command_is_set(&self.models.command) {
            errors.push("models.command must be a non-empty array");
        }
        if self.models.critic_model.trim().is_empty() || self.models.worker_model.trim().is_empty()
        {
            errors.push("models.critic_model and models.worker_model are required");
        }
        if self.models.prompt_budget_bytes == 0 {
            errors.push("models.prompt_budget_bytes must be > 0");
        }
        if self.loops.max_feedback_iterations == 0 {
            errors.push("loops.max_feedback_iterations must be at least 1");
        }
        if self.loops.sql_refinement_iterations == 0 {
            errors.push("loops.sql_refinement_iterations must be at least 1");
        }
        if !errors.is_empty() {
            bail!("configuration validation failed:\n- {}", errors.join("\n- "));
        }
        Ok(())
    }

    /// Apply deployment environment variables on top of file values.
    ///
    /// `lookup` abstracts `std::env::var` so tests can supply a fixed map.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(project) = get("GOOGLE_CLOUD_PROJECT").or_else(|| get("GCP_PROJECT_ID")) {
            self.warehouse.project = Some(project);
        }
        if let Some(location) = get("GOOGLE_CLOUD_LOCATION") {
            self.warehouse.location = location;
        }
        self.warehouse.location = self.warehouse.location.to_lowercase();
        if let Some(dataset) = get("GOOGLE_BQ_DATASET") {
            self.warehouse.dataset = dataset;
        }
        if let Some(connection) = get("GOOGLE_BQ_CONNECTION_ID") {
            self.warehouse.connection_id = Some(connection);
        }

        let root_model = get("ROOT_AGENT_MODEL");
        if let Some(model) = get("CRITIC_MODEL").or_else(|| root_model.clone()) {
            self.models.critic_model = model;
        }
        if let Some(model) = get("WORKER_MODEL").or(root_model) {
            self.models.worker_model = model;
        }

        if let Some(raw) = get("MAX_FEEDBACK_ITERATION") {
            match raw.trim().parse::<u32>() {
                Ok(value) => self.loops.max_feedback_iterations = value,
                Err(_) => warn!(
                    value = %raw,
                    keep = self.loops.max_feedback_iterations,
                    "invalid MAX_FEEDBACK_ITERATION, keeping current value"
                ),
            }
        }
    }

    /// Seed values for a session.
    pub fn coordinates(&self) -> WarehouseCoordinates {
        WarehouseCoordinates {
            project: self.warehouse.project.clone().unwrap_or_default(),
            location: self.warehouse.location.clone(),
            dataset: self.warehouse.dataset.clone(),
            connection_id: self.warehouse.connection_id.clone(),
        }
    }

    /// One-line summary for logs with the connection id masked.
    pub fn redacted_summary(&self) -> String {
        format!(
            "project={} location={} dataset={} connection_id={} critic_model={} worker_model={} max_feedback_iterations={} sql_refinement_iterations={}",
            self.warehouse.project.as_deref().unwrap_or("<unset>"),
            self.warehouse.location,
            self.warehouse.dataset,
            if self.warehouse.connection_id.is_some() {
                "***masked***"
            } else {
                "<unset>"
            },
            self.models.critic_model,
            self.models.worker_model,
            self.loops.max_feedback_iterations,
            self.loops.sql_refinement_iterations,
        )
    }
}

fn command_is_set(command: &[String]) -> bool {
    command.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file and the process environment.
///
/// A missing file yields defaults; the merged result is validated.
pub fn load_config(path: &Path) -> Result<DeepdbConfig> {
    let mut cfg = read_config_file(path)?;
    cfg.apply_env(|name| std::env::var(name).ok());
    cfg.validate()?;
    debug!(config = %cfg.redacted_summary(), "config loaded");
    Ok(cfg)
}

/// Read the TOML file without environment overrides or validation.
pub fn read_config_file(path: &Path) -> Result<DeepdbConfig> {
    if !path.exists() {
        return Ok(DeepdbConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DeepdbConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn with_project() -> DeepdbConfig {
        let mut cfg = DeepdbConfig::default();
        cfg.warehouse.project = Some("proj".to_string());
        cfg
    }

    #[test]
    fn defaults_need_only_a_project() {
        let err = DeepdbConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("warehouse.project is required"));
        with_project().validate().expect("valid");
    }

    #[test]
    fn missing_file_reads_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = read_config_file(&temp.path().join("missing.toml")).expect("read");
        assert_eq!(cfg, DeepdbConfig::default());
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".deepdb/config.toml");
        let cfg = with_project();
        write_config(&path, &cfg).expect("write");
        assert_eq!(read_config_file(&path).expect("read"), cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[loops]\nmax_feedback_iterations = 4\n").expect("write");
        let cfg = read_config_file(&path).expect("read");
        assert_eq!(cfg.loops.max_feedback_iterations, 4);
        assert_eq!(cfg.loops.sql_refinement_iterations, 5);
        assert_eq!(cfg.warehouse.max_rows, 1000);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = DeepdbConfig::default();
        cfg.apply_env(env(&[
            ("GCP_PROJECT_ID", "fallback"),
            ("GOOGLE_CLOUD_PROJECT", "primary"),
            ("GOOGLE_CLOUD_LOCATION", "EU"),
            ("GOOGLE_BQ_DATASET", "orders"),
            ("GOOGLE_BQ_CONNECTION_ID", "conn-1"),
            ("ROOT_AGENT_MODEL", "root-model"),
            ("WORKER_MODEL", "worker-x"),
            ("MAX_FEEDBACK_ITERATION", "3"),
        ]));
        assert_eq!(cfg.warehouse.project.as_deref(), Some("primary"));
        assert_eq!(cfg.warehouse.location, "eu");
        assert_eq!(cfg.warehouse.dataset, "orders");
        assert_eq!(cfg.models.critic_model, "root-model");
        assert_eq!(cfg.models.worker_model, "worker-x");
        assert_eq!(cfg.loops.max_feedback_iterations, 3);
        cfg.validate().expect("valid");
    }

    #[test]
    fn invalid_iteration_env_keeps_value() {
        let mut cfg = with_project();
        cfg.apply_env(env(&[("MAX_FEEDBACK_ITERATION", "many")]));
        assert_eq!(cfg.loops.max_feedback_iterations, 2);
    }

    #[test]
    fn zero_iterations_are_rejected() {
        let mut cfg = with_project();
        cfg.apply_env(env(&[("MAX_FEEDBACK_ITERATION", "0")]));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_feedback_iterations"));
    }

    #[test]
    fn summary_masks_connection_id() {
        let mut cfg = with_project();
        cfg.warehouse.connection_id = Some("secret-connection".to_string());
        let summary = cfg.redacted_summary();
        assert!(summary.contains("***masked***"));
        assert!(!summary.contains("secret-connection"));
    }
}
