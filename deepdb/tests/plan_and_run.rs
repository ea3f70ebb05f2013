//! `plan` then `run` over a scratch workspace with scripted backends.

use std::fs;

use deepdb::core::execution::{QueryResult, QueryRows};
use deepdb::core::state::{SessionState, StateKey};
use deepdb::io::config::DeepdbConfig;
use deepdb::io::init::{DeepdbPaths, InitOptions, init_workspace};
use deepdb::io::plan_doc::read_plan;
use deepdb::plan::{PlanOptions, plan_research};
use deepdb::run::{RunOptions, run_research};
use deepdb::test_support::{ScriptedModel, ScriptedWarehouse};
use serde_json::json;

const REQUEST: &str = "Which region placed the most orders last quarter?";

fn config() -> DeepdbConfig {
    let mut cfg = DeepdbConfig::default();
    cfg.warehouse.project = Some("test-project".to_string());
    cfg.warehouse.dataset = "sales".to_string();
    cfg.loops.sql_refinement_iterations = 1;
    cfg.loops.max_feedback_iterations = 1;
    cfg
}

fn warehouse() -> ScriptedWarehouse {
    ScriptedWarehouse::new()
        .with_table(
            "orders",
            json!({"columns": [{"name": "region", "type": "STRING"}], "numRows": "19"}),
        )
        .with_result(QueryResult::Success(QueryRows {
            columns: vec!["region".to_string(), "orders".to_string()],
            rows: vec![
                vec!["EU".to_string(), "12".to_string()],
                vec!["US".to_string(), "7".to_string()],
            ],
        }))
}

#[test]
fn plan_refine_then_run_writes_report_and_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    init_workspace(root, &InitOptions { force: false }).expect("init");
    let cfg = config();
    let warehouse = warehouse();
    let model = ScriptedModel::new();

    // Draft: one metadata lookup, then the plan.
    model.on(
        "plan_creator",
        r#"{"action":"call_tool","tool":"list_table_ids","arguments":{}}"#,
    );
    model.on(
        "plan_creator",
        r#"{"action":"final","output":"1. Count orders per region."}"#,
    );
    let drafted = plan_research(
        root,
        &cfg,
        &model,
        &warehouse,
        &PlanOptions {
            request: Some(REQUEST.to_string()),
            feedback: None,
        },
    )
    .expect("plan");
    assert!(!drafted.refined);
    let plan_prompts: Vec<String> = model
        .calls()
        .iter()
        .map(|call| call.request.prompt.clone())
        .collect();
    assert!(plan_prompts[1].contains("\"orders\""));

    // Refine with reviewer feedback; the request is carried over.
    model.on(
        "plan_creator",
        r#"{"action":"final","output":"1. Count orders per region.\n2. Rank regions."}"#,
    );
    let refined = plan_research(
        root,
        &cfg,
        &model,
        &warehouse,
        &PlanOptions {
            request: None,
            feedback: Some("rank the regions too".to_string()),
        },
    )
    .expect("refine");
    assert!(refined.refined);
    let refine_prompt = &model.calls()[2].request.prompt;
    assert!(refine_prompt.contains("rank the regions too"));
    assert!(refine_prompt.contains("1. Count orders per region."));

    let paths = DeepdbPaths::new(root);
    let plan = read_plan(&paths.plan_path).expect("read").expect("plan");
    assert_eq!(plan.request, REQUEST);
    assert!(plan.plan.contains("Rank regions"));

    // Run the approved plan.
    let sql = "SELECT region, COUNT(*) AS orders FROM sales.orders GROUP BY region";
    model.on("query_understanding", "Orders per region, ranked.");
    model.on("query_generation", &json!({"action": "final", "output": sql}).to_string());
    model.on(
        "query_execution",
        &json!({"action": "call_tool", "tool": "execute_sql", "arguments": {"sql": sql}})
            .to_string(),
    );
    model.on(
        "query_execution",
        r#"{"action":"final","output":{"status":"success","result_table":"| region | orders |\n|---|---|\n| EU | 12 |\n| US | 7 |\n"}}"#,
    );
    model.on("query_review_rewrite", sql);
    model.on("report_structure_planner", "## Ranking");
    model.on("section_research", "EU leads with 12 orders, US follows with 7.");
    model.on(
        "research_evaluator",
        r#"{"grade":"pass","comment":"Matches the table."}"#,
    );
    model.on("report_revision", "EU leads with 12 orders, US follows with 7.");
    model.on("report_composer", "# Orders by region\n\nEU leads with 12 orders.");

    let summary = run_research(root, &cfg, &model, &warehouse, &RunOptions::default())
        .expect("run");

    assert_eq!(model.unused(), 0);
    assert_eq!(
        fs::read_to_string(&summary.report_path).expect("report"),
        "# Orders by region\n\nEU leads with 12 orders."
    );
    assert!(summary.run_dir.starts_with(root.join(".deepdb/runs")));

    let state_raw = fs::read_to_string(summary.run_dir.join("state.json")).expect("state");
    let state: SessionState = serde_json::from_str(&state_raw).expect("parse state");
    assert_eq!(state.text(StateKey::UserRequest), Some(REQUEST));
    assert_eq!(state.text(StateKey::Project), Some("test-project"));
    assert!(state.is_set(StateKey::FinalReport));

    let mut stage_dirs: Vec<String> = fs::read_dir(&summary.run_dir)
        .expect("run dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    stage_dirs.sort();
    assert_eq!(
        stage_dirs,
        vec![
            "001-query_understanding",
            "002-query_generation",
            "003-query_execution",
            "004-query_review_rewrite",
            "005-report_structure_planner",
            "006-section_research",
            "007-research_evaluator",
            "008-report_revision",
            "009-report_composer",
        ]
    );
    let execution_dir = summary.run_dir.join("003-query_execution");
    assert!(execution_dir.join("prompt-2.md").is_file());
    assert!(execution_dir.join("meta.json").is_file());
    assert!(
        summary
            .run_dir
            .join("007-research_evaluator")
            .join("feedback.schema.json")
            .is_file()
    );
}

#[test]
fn run_without_a_plan_fails_before_calling_the_model() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
    let model = ScriptedModel::new();

    let err = run_research(
        temp.path(),
        &config(),
        &model,
        &ScriptedWarehouse::new(),
        &RunOptions::default(),
    )
    .unwrap_err();

    assert!(err.to_string().contains("deepdb plan"));
    assert!(model.calls().is_empty());
}

#[test]
fn plan_without_request_or_existing_plan_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = plan_research(
        temp.path(),
        &config(),
        &ScriptedModel::new(),
        &ScriptedWarehouse::new(),
        &PlanOptions::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("no research request"));
}
