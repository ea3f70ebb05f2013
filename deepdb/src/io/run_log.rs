//! Run artifacts under `.deepdb/runs/<run-id>/`.
//!
//! Every stage invocation gets its own numbered directory with the prompts,
//! raw replies and model logs of each turn plus a `meta.json`. `state.json`
//! at the run root is rewritten after every step so a failed run can be
//! inspected and its prompts re-rendered.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::core::state::SessionState;

/// Directory layout for one stage invocation.
#[derive(Debug, Clone)]
pub struct StagePaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
}

impl StagePaths {
    pub fn prompt_path(&self, turn: u32) -> PathBuf {
        self.dir.join(format!("prompt-{turn}.md"))
    }

    pub fn output_path(&self, turn: u32) -> PathBuf {
        self.dir.join(format!("output-{turn}.txt"))
    }

    pub fn log_path(&self, turn: u32) -> PathBuf {
        self.dir.join(format!("model-{turn}.log"))
    }
}

/// Summary written to `meta.json` once a stage finishes.
#[derive(Debug, Clone, Serialize)]
pub struct StageMeta {
    pub stage: String,
    pub model: String,
    pub output_key: String,
    pub turns: u32,
    pub tool_calls: u32,
    /// RFC 3339 timestamps.
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Artifact writer for one pipeline run.
#[derive(Debug)]
pub struct RunLog {
    run_id: String,
    dir: PathBuf,
    next_seq: Cell<u32>,
}

impl RunLog {
    /// Create a fresh run directory under `<root>/.deepdb/runs/`.
    pub fn create(root: &Path) -> Result<Self> {
        let runs_dir = root.join(".deepdb").join("runs");
        let base = format!("run-{}", Utc::now().format("%Y%m%d_%H%M%S"));
        for suffix in 1..=999u32 {
            let run_id = if suffix == 1 {
                base.clone()
            } else {
                format!("{base}-{suffix}")
            };
            let dir = runs_dir.join(&run_id);
            if !dir.exists() {
                return Self::with_id(&runs_dir, run_id);
            }
        }
        bail!("unable to allocate a run directory for {base}")
    }

    fn with_id(runs_dir: &Path, run_id: String) -> Result<Self> {
        let dir = runs_dir.join(&run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        debug!(run_id = %run_id, dir = %dir.display(), "run log created");
        Ok(Self {
            run_id,
            dir,
            next_seq: Cell::new(1),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate the next `NNN-<stage>` directory.
    pub fn stage_dir(&self, stage: &str) -> Result<StagePaths> {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let dir = self.dir.join(format!("{seq:03}-{stage}"));
        fs::create_dir_all(&dir)
            .with_context(|| format!("create stage dir {}", dir.display()))?;
        Ok(StagePaths {
            meta_path: dir.join("meta.json"),
            dir,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    /// Atomically replace `state.json` with the current state.
    pub fn write_state(&self, state: &SessionState) -> Result<()> {
        write_json_atomic(&self.state_path(), state)
    }

    pub fn write_text(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.join(name);
        write_text(&path, contents)?;
        Ok(path)
    }
}

pub fn write_stage_meta(paths: &StagePaths, meta: &StageMeta) -> Result<()> {
    write_json_atomic(&paths.meta_path, meta)
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    write_text(&tmp_path, &buf)?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
}
