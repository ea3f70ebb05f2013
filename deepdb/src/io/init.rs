//! Scaffolding for the `.deepdb/` workspace directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::io::config::{DeepdbConfig, write_config};

/// Canonical paths within `.deepdb/` for a project root.
#[derive(Debug, Clone)]
pub struct DeepdbPaths {
    pub root: PathBuf,
    pub deepdb_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    /// Approved research plan written by `deepdb plan`.
    pub plan_path: PathBuf,
}

impl DeepdbPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let deepdb_dir = root.join(".deepdb");
        Self {
            root,
            runs_dir: deepdb_dir.join("runs"),
            gitignore_path: deepdb_dir.join(".gitignore"),
            config_path: deepdb_dir.join("config.toml"),
            plan_path: deepdb_dir.join("plan.md"),
            deepdb_dir,
        }
    }
}

/// Options for [`init_workspace`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config with defaults.
    pub force: bool,
}

/// Create `.deepdb/` with a default config.
///
/// Fails if `.deepdb/` already exists unless `options.force` is set. Run
/// history and an existing plan are never removed.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<DeepdbPaths> {
    let paths = DeepdbPaths::new(root);
    if paths.deepdb_dir.exists() && !paths.deepdb_dir.is_dir() {
        bail!("deepdb init: .deepdb exists but is not a directory");
    }
    if paths.deepdb_dir.exists() && !options.force {
        bail!("deepdb init: .deepdb already exists (use --force to overwrite)");
    }

    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    fs::write(&paths.gitignore_path, DEEPDB_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &DeepdbConfig::default())?;

    Ok(paths)
}

const DEEPDB_GITIGNORE: &str = "runs/\n";
