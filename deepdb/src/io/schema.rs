//! JSON Schemas for structured stage output and the tool-call envelope.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::core::feedback::Feedback;
use crate::core::sql::strip_code_fence;
use crate::core::state::{StateKey, ValueKind};

const FEEDBACK_SCHEMA: &str = include_str!("../../schemas/feedback.schema.json");
const EXECUTION_REPORT_SCHEMA: &str = include_str!("../../schemas/execution_report.schema.json");

/// Schema attached to a structured state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSchema {
    Feedback,
    ExecutionReport,
}

impl OutputSchema {
    /// Schema for the value stored at `key`, if the key is structured.
    pub fn for_key(key: StateKey) -> Option<Self> {
        match key.kind() {
            ValueKind::Evaluation => Some(OutputSchema::Feedback),
            ValueKind::Execution => Some(OutputSchema::ExecutionReport),
            ValueKind::Text | ValueKind::Sql => None,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            OutputSchema::Feedback => "feedback.schema.json",
            OutputSchema::ExecutionReport => "execution_report.schema.json",
        }
    }

    pub fn value(self) -> Result<Value> {
        let raw = match self {
            OutputSchema::Feedback => FEEDBACK_SCHEMA,
            OutputSchema::ExecutionReport => EXECUTION_REPORT_SCHEMA,
        };
        serde_json::from_str(raw).with_context(|| format!("parse {}", self.file_name()))
    }

    /// Write the schema into `dir` so a model backend can be pointed at it.
    pub fn write_to(self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        let mut buf = serde_json::to_string_pretty(&self.value()?)?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write schema {}", path.display()))?;
        Ok(path)
    }
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
pub fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Parse a model reply as JSON, validate it, and deserialize it.
///
/// A surrounding markdown fence is tolerated.
pub fn parse_validated<T: DeserializeOwned>(reply: &str, schema: OutputSchema) -> Result<T> {
    let value: Value =
        serde_json::from_str(strip_code_fence(reply)).context("parse structured output json")?;
    validate_value(value, schema)
}

/// Validate an already-parsed value and deserialize it.
pub fn validate_value<T: DeserializeOwned>(value: Value, schema: OutputSchema) -> Result<T> {
    validate_schema(&value, &schema.value()?)
        .with_context(|| format!("validate against {}", schema.file_name()))?;
    serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", schema.file_name()))
}

/// Load a feedback record and enforce its invariants on top of the schema.
pub fn load_feedback(raw: &str) -> Result<Feedback> {
    let feedback: Feedback = parse_validated(raw, OutputSchema::Feedback)?;
    let errors = feedback.invariant_violations();
    if !errors.is_empty() {
        bail!("feedback invariant violations:\n- {}", errors.join("\n- "));
    }
    Ok(feedback)
}

/// Envelope every turn of a tool-enabled stage must match.
pub fn tool_envelope_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Tool exchange turn",
        "type": "object",
        "oneOf": [
            {
                "additionalProperties": false,
                "required": ["action", "tool"],
                "properties": {
                    "action": { "const": "call_tool" },
                    "tool": { "type": "string", "minLength": 1 },
                    "arguments": { "type": "object" }
                }
            },
            {
                "additionalProperties": false,
                "required": ["action", "output"],
                "properties": {
                    "action": { "const": "final" },
                    "output": {}
                }
            }
        ]
    })
}
