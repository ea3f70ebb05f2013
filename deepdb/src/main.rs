//! deepdb: plan, run and check NL-to-SQL research reports.
//!
//! `deepdb plan` drafts a research plan for review; `deepdb run` executes the
//! approved plan through the SQL refinement and report evaluation loops.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use deepdb::check::{CheckOutcome, check_feedback_file};
use deepdb::exit_codes;
use deepdb::io::config::load_config;
use deepdb::io::init::{DeepdbPaths, InitOptions, init_workspace};
use deepdb::io::model::CodexExecutor;
use deepdb::io::warehouse::BqCliWarehouse;
use deepdb::logging;
use deepdb::plan::{PlanOptions, plan_research};
use deepdb::render::{load_state, render_stage_prompt};
use deepdb::run::{RunOptions, run_research};

#[derive(Parser)]
#[command(
    name = "deepdb",
    version,
    about = "Answer data questions with iteratively refined SQL and fact-checked reports"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.deepdb/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Draft a research plan, or refine the current one with feedback.
    Plan {
        /// Research request; defaults to the request of the current plan.
        request: Option<String>,
        /// Notes on the current plan to address.
        #[arg(short, long)]
        feedback: Option<String>,
    },
    /// Execute the approved plan and print the final report.
    Run {
        /// Plan file to execute instead of `.deepdb/plan.md`.
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Validate a feedback record (exit 0 pass, 2 fail, 1 invalid).
    Check {
        /// Path to a feedback JSON file.
        path: PathBuf,
    },
    /// Print a stage's prompt for a saved `state.json`.
    Render {
        /// Stage name, e.g. `research_evaluator`.
        stage: String,
        #[arg(long)]
        state: PathBuf,
    },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Plan { request, feedback } => cmd_plan(&root, request, feedback),
        Command::Run { plan } => cmd_run(&root, plan),
        Command::Check { path } => cmd_check(&path),
        Command::Render { stage, state } => cmd_render(&root, &stage, &state),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.deepdb_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_plan(root: &Path, request: Option<String>, feedback: Option<String>) -> Result<i32> {
    let paths = DeepdbPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    let executor = CodexExecutor::new(cfg.models.command.clone())?;
    let warehouse = BqCliWarehouse::from_config(&cfg.warehouse)?;
    let outcome = plan_research(
        root,
        &cfg,
        &executor,
        &warehouse,
        &PlanOptions { request, feedback },
    )?;
    println!("{}", outcome.plan.plan);
    eprintln!(
        "plan {} at {}; review it, then `deepdb run` or `deepdb plan --feedback ...`",
        if outcome.refined { "refined" } else { "written" },
        outcome.path.display()
    );
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, plan: Option<PathBuf>) -> Result<i32> {
    let paths = DeepdbPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    let executor = CodexExecutor::new(cfg.models.command.clone())?;
    let warehouse = BqCliWarehouse::from_config(&cfg.warehouse)?;
    let summary = run_research(
        root,
        &cfg,
        &executor,
        &warehouse,
        &RunOptions { plan_path: plan },
    )?;
    println!("{}", summary.outcome.final_report);
    if let Some(error) = &summary.outcome.unresolved_query_error {
        eprintln!(
            "warning: the query still failed after refinement ({}: {})",
            error.error_type, error.message
        );
    }
    eprintln!("report written to {}", summary.report_path.display());
    Ok(exit_codes::OK)
}

fn cmd_check(path: &Path) -> Result<i32> {
    let (feedback, outcome) = check_feedback_file(path)?;
    Ok(match outcome {
        CheckOutcome::Pass => {
            println!("pass: {}", feedback.comment);
            exit_codes::OK
        }
        CheckOutcome::Fail { corrections } => {
            println!("fail ({corrections} corrections): {}", feedback.comment);
            exit_codes::GRADE_FAIL
        }
    })
}

fn cmd_render(root: &Path, stage: &str, state_path: &Path) -> Result<i32> {
    let paths = DeepdbPaths::new(root);
    let budget = deepdb::io::config::read_config_file(&paths.config_path)?
        .models
        .prompt_budget_bytes;
    let state = load_state(state_path)?;
    println!("{}", render_stage_prompt(stage, &state, budget)?);
    Ok(exit_codes::OK)
}
