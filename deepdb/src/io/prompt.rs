//! Prompt rendering for model stages.
//!
//! Templates are compiled into the binary. Every variable a template
//! references must be a [`StateKey`] name or one of the values the engine
//! supplies itself; anything else is rejected when the engine is built.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use minijinja::{Environment, Value as TemplateValue, context};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::state::{SessionState, StateKey};
use crate::io::tools::{ToolReply, ToolSpec};

const TEMPLATES: &[(&str, &str)] = &[
    ("plan_creator", include_str!("prompts/plan_creator.md")),
    (
        "query_understanding",
        include_str!("prompts/query_understanding.md"),
    ),
    ("query_generation", include_str!("prompts/query_generation.md")),
    ("query_execution", include_str!("prompts/query_execution.md")),
    (
        "query_review_rewrite",
        include_str!("prompts/query_review_rewrite.md"),
    ),
    (
        "report_structure_planner",
        include_str!("prompts/report_structure_planner.md"),
    ),
    ("section_research", include_str!("prompts/section_research.md")),
    (
        "research_evaluator",
        include_str!("prompts/research_evaluator.md"),
    ),
    ("report_revision", include_str!("prompts/report_revision.md")),
    ("report_composer", include_str!("prompts/report_composer.md")),
];

const TOOL_PROTOCOL_TEMPLATE: &str = include_str!("prompts/tool_protocol.md");

/// Variables provided by the engine rather than by state.
const ENGINE_VARIABLES: &[&str] = &["current_query", "tools", "transcript", "remaining_tool_calls"];

/// Drop order when a prompt exceeds its budget; earlier keys go first.
const DROP_ORDER: &[&str] = &[
    "dataset",
    "feedback",
    "understanding",
    "plan",
    "structure",
    "query_result",
    "evaluation",
    "findings",
];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

/// One completed tool call, carried into later turns of the same stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExchange {
    pub tool: String,
    pub arguments: Value,
    pub reply: ToolReply,
}

/// Tool context for a tool-enabled stage turn.
#[derive(Debug, Clone, Copy)]
pub struct ToolTurn<'a> {
    pub specs: &'a [ToolSpec],
    pub transcript: &'a [ToolExchange],
    pub remaining_calls: u32,
}

#[derive(Serialize)]
struct ExchangeView {
    index: usize,
    tool: String,
    arguments: String,
    reply: String,
}

/// Template engine wrapper around minijinja with a prompt byte budget.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("compile prompt template {name}"))?;
        }
        env.add_template("tool_protocol", TOOL_PROTOCOL_TEMPLATE)
            .context("compile prompt template tool_protocol")?;

        let engine = Self { env, budget_bytes };
        for (name, _) in TEMPLATES {
            let unknown = engine.unknown_references(name)?;
            if !unknown.is_empty() {
                bail!(
                    "prompt template {name} references unknown keys: {}",
                    unknown.into_iter().collect::<Vec<_>>().join(", ")
                );
            }
        }
        Ok(engine)
    }

    pub fn template_names() -> impl Iterator<Item = &'static str> {
        TEMPLATES.iter().map(|(name, _)| *name)
    }

    /// State keys a template reads.
    pub fn referenced_keys(&self, template: &str) -> Result<Vec<StateKey>> {
        let tmpl = self.env.get_template(template)?;
        let mut keys: Vec<StateKey> = tmpl
            .undeclared_variables(false)
            .iter()
            .filter_map(|name| StateKey::parse(name))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn unknown_references(&self, template: &str) -> Result<BTreeSet<String>> {
        let tmpl = self.env.get_template(template)?;
        Ok(tmpl
            .undeclared_variables(false)
            .into_iter()
            .filter(|name| StateKey::parse(name).is_none() && !ENGINE_VARIABLES.contains(&name.as_str()))
            .collect())
    }

    /// Render `template` over `state`, appending the tool protocol when the
    /// stage has tools, then fit the result into the byte budget.
    pub fn render(
        &self,
        template: &str,
        state: &SessionState,
        tools: Option<ToolTurn<'_>>,
    ) -> Result<String> {
        let tmpl = self
            .env
            .get_template(template)
            .map_err(|err| anyhow!("unknown prompt template {template}: {err}"))?;

        let mut ctx = state.render_context();
        if let Some(query) = state.current_query() {
            ctx.insert(
                "current_query".to_string(),
                Value::String(query.to_string()),
            );
        }
        let mut rendered = tmpl
            .render(TemplateValue::from_serialize(&ctx))
            .with_context(|| format!("render prompt template {template}"))?;

        if let Some(turn) = tools {
            let transcript: Vec<ExchangeView> = turn
                .transcript
                .iter()
                .enumerate()
                .map(|(idx, exchange)| ExchangeView {
                    index: idx + 1,
                    tool: exchange.tool.clone(),
                    arguments: exchange.arguments.to_string(),
                    reply: serde_json::to_string(&exchange.reply).unwrap_or_default(),
                })
                .collect();
            let protocol = self.env.get_template("tool_protocol")?.render(context! {
                tools => turn.specs,
                transcript => transcript,
                remaining_tool_calls => turn.remaining_calls,
            })?;
            rendered.push('\n');
            rendered.push_str(&protocol);
        }

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered output using `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        // Conditional blocks render to nothing when their keys are absent.
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Drop droppable sections in [`DROP_ORDER`], then truncate the last section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut() {
        let before_len = last.content.len();
        let marker = "\n[truncated]";
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
        last.content.truncate(keep);
        if allowed > marker.len() {
            last.content.push_str(marker);
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::execution::{ExecutionReport, QueryError};
    use crate::core::state::StateValue;
    use crate::test_support::coordinates;
    use serde_json::json;

    fn engine() -> PromptEngine {
        PromptEngine::new(100_000).expect("engine")
    }

    fn state() -> SessionState {
        SessionState::seeded(&coordinates(), "Which regions grew fastest last quarter?")
    }

    #[test]
    fn every_template_compiles_and_references_known_keys() {
        let engine = engine();
        for name in PromptEngine::template_names() {
            assert!(engine.unknown_references(name).expect("refs").is_empty(), "{name}");
        }
    }

    #[test]
    fn referenced_keys_follow_the_stage_inputs() {
        let engine = engine();
        let keys = engine.referenced_keys("query_review_rewrite").expect("keys");
        assert!(keys.contains(&StateKey::QueryUnderstandingOutput));
        assert!(keys.contains(&StateKey::QueryExecutionOutput));
        assert!(!keys.contains(&StateKey::FinalReport));
    }

    #[test]
    fn missing_optional_keys_render_empty() {
        let prompt = engine().render("plan_creator", &state(), None).expect("render");
        assert!(prompt.contains("Which regions grew fastest last quarter?"));
        assert!(prompt.contains("test-project"));
        assert!(!prompt.contains("<plan_feedback>"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn execution_uses_latest_rewrite() {
        let mut state = state();
        state
            .write(
                StateKey::QueryGenerationOutput,
                StateValue::Text("SELECT region FROM orders".to_string()),
            )
            .expect("write");
        let prompt = engine().render("query_execution", &state, None).expect("render");
        assert!(prompt.contains("SELECT region FROM orders"));

        state
            .write(
                StateKey::QueryReviewRewriteOutput,
                StateValue::Text("SELECT region, COUNT(*) AS n FROM orders GROUP BY region".to_string()),
            )
            .expect("write");
        let prompt = engine().render("query_execution", &state, None).expect("render");
        assert!(prompt.contains("GROUP BY region"));
    }

    #[test]
    fn review_prompt_exposes_structured_error() {
        let mut state = state();
        state
            .write(
                StateKey::QueryExecutionOutput,
                StateValue::Execution(ExecutionReport::Error {
                    error: QueryError {
                        error_type: "syntax_error".to_string(),
                        message: "Unexpected keyword FROM at [2:1]".to_string(),
                        fragment: Some("FROM orders".to_string()),
                    },
                }),
            )
            .expect("write");
        let prompt = engine()
            .render("query_review_rewrite", &state, None)
            .expect("render");
        assert!(prompt.contains("error_type: syntax_error"));
        assert!(prompt.contains("fragment: FROM orders"));
    }

    #[test]
    fn tool_turn_appends_protocol_and_transcript() {
        let specs = vec![ToolSpec {
            name: "execute_sql",
            description: "Run a query.",
            arguments: r#"{"sql": "SELECT 1"}"#,
        }];
        let transcript = vec![ToolExchange {
            tool: "execute_sql".to_string(),
            arguments: json!({"sql": "SELECT 1"}),
            reply: ToolReply::Ok(json!({"status": "success", "result_table": "| n |"})),
        }];
        let prompt = engine()
            .render(
                "query_execution",
                &state(),
                Some(ToolTurn {
                    specs: &specs,
                    transcript: &transcript,
                    remaining_calls: 3,
                }),
            )
            .expect("render");
        assert!(prompt.contains("execute_sql"));
        assert!(prompt.contains("\"action\": \"call_tool\""));
        assert!(prompt.contains("Call 1"));
        assert!(prompt.contains("3 tool calls remaining"));
    }

    #[test]
    fn budget_drops_context_before_instructions() {
        let mut state = state();
        state
            .write(
                StateKey::ResearchPlan,
                StateValue::Text("plan ".repeat(400)),
            )
            .expect("write");
        state
            .write(
                StateKey::QueryUnderstandingOutput,
                StateValue::Text("understanding ".repeat(400)),
            )
            .expect("write");
        let full = engine().render("query_generation", &state, None).expect("render");
        assert!(full.contains("understanding understanding"));

        let tight = PromptEngine::new(1_500)
            .expect("engine")
            .render("query_generation", &state, None)
            .expect("render");
        assert!(tight.len() < full.len());
        assert!(tight.contains("<instructions>"));
        assert!(!tight.contains("<dataset>"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut sections = vec![ParsedSection {
            key: "findings".to_string(),
            required: true,
            content: "é".repeat(100),
        }];
        apply_budget_to_sections(&mut sections, 51);
        assert!(sections[0].content.ends_with("[truncated]"));
        assert!(sections[0].content.len() <= 51);
    }
}
