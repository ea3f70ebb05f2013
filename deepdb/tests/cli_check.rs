//! CLI tests for `deepdb check` and `deepdb init`.
//!
//! Spawns the binary and verifies exit codes for passing, failing and
//! invalid feedback records.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use deepdb::exit_codes;
use deepdb::io::init::DeepdbPaths;

fn deepdb(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_deepdb"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("spawn deepdb")
}

fn check(contents: &str) -> Output {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("feedback.json");
    fs::write(&path, contents).expect("write feedback");
    deepdb(temp.path(), &["check", "feedback.json"])
}

#[test]
fn passing_record_exits_ok() {
    let output = check(r#"{"grade":"pass","comment":"All figures match."}"#);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("pass"));
}

#[test]
fn failing_record_exits_with_grade_fail() {
    let output = check(
        r#"{"grade":"fail","comment":"Totals are off.","corrections_needed":[
            {"section_identifier":"Totals","problematic_content":"40 orders",
             "issue_type":"contradictory_info","correction_instruction":"Use 12."}]}"#,
    );
    assert_eq!(output.status.code(), Some(exit_codes::GRADE_FAIL));
    assert!(String::from_utf8_lossy(&output.stdout).contains("1 corrections"));
}

#[test]
fn pass_with_corrections_is_invalid() {
    let output = check(
        r#"{"grade":"pass","comment":"Fine.","corrections_needed":[
            {"section_identifier":"Intro","problematic_content":"all regions grew",
             "issue_type":"overgeneralization","correction_instruction":"Only EU grew."}]}"#,
    );
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("schema validation failed"));
}

#[test]
fn malformed_json_is_invalid() {
    let output = check("grade: pass");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn init_twice_without_force_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = deepdb(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert!(DeepdbPaths::new(temp.path()).config_path.is_file());

    let second = deepdb(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&second.stderr).contains("already exists"));
}
