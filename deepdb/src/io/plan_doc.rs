//! The approved research plan at `.deepdb/plan.md`.
//!
//! The plan body is human-editable markdown. The request it answers is kept
//! in YAML frontmatter so `deepdb run` can seed `user_request` without the
//! user repeating it.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};

/// A research plan and the request it was drafted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDocument {
    pub request: String,
    pub plan: String,
}

impl PlanDocument {
    pub fn render(&self) -> Result<String> {
        let request = serde_json::to_string(&self.request).context("encode request")?;
        let mut buf = format!("---\nrequest: {request}\n---\n\n");
        buf.push_str(self.plan.trim());
        buf.push('\n');
        Ok(buf)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let (frontmatter, body) = split_frontmatter(contents)
            .ok_or_else(|| anyhow!("plan is missing its frontmatter block"))?;
        let request = frontmatter_value(frontmatter, "request")
            .ok_or_else(|| anyhow!("plan frontmatter has no `request`"))??;
        let plan = body.trim().to_string();
        if request.trim().is_empty() {
            bail!("plan frontmatter `request` is empty");
        }
        if plan.is_empty() {
            bail!("plan body is empty");
        }
        Ok(Self { request, plan })
    }
}

/// Load a plan; `Ok(None)` when the file does not exist.
pub fn read_plan(path: &Path) -> Result<Option<PlanDocument>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    PlanDocument::parse(&contents)
        .with_context(|| format!("parse plan {}", path.display()))
        .map(Some)
}

pub fn write_plan(path: &Path, doc: &PlanDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, doc.render()?).with_context(|| format!("write {}", path.display()))
}

fn frontmatter_value(frontmatter: &str, name: &str) -> Option<Result<String>> {
    frontmatter.lines().find_map(|line| {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let (key, value) = trimmed.split_once(':')?;
        if key.trim() != name {
            return None;
        }
        let value = value.trim();
        Some(if value.starts_with('"') {
            serde_json::from_str::<String>(value).with_context(|| format!("decode `{name}`"))
        } else if let Some(inner) = value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
            Ok(inner.to_string())
        } else {
            Ok(value.to_string())
        })
    })
}

fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let after = contents.strip_prefix("---\n")?;
    let end = after.find("\n---\n")?;
    Some((&after[..end], &after[end + 5..]))
}
