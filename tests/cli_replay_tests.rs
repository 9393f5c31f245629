//! Replay programs through the diverdown binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests
//!
//! Text and JSON output, `-e trace=` overrides and config errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("diverdown.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_text_output_for_module_chain() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, r#"modules = ["A", "B", "C"]"#);

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("--config")
        .arg(&config)
        .arg("--title")
        .arg("chain")
        .arg(fixture("module_chain.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("# chain\n"))
        .stdout(predicate::str::contains("A -> B.call_c  /app/tracer_module.rb:8"))
        .stdout(predicate::str::contains("B -> C.call_d  /app/tracer_module.rb:14"))
        .stdout(predicate::str::contains("\nC\n"))
        .stdout(predicate::str::contains("-> D").not());
}

#[test]
fn test_include_by_path_from_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        r#"
title = "included"
definition_group = "app"
include = ["/app/tracer_module.rb"]
"#,
    );

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-c")
        .arg(&config)
        .arg(fixture("module_chain.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("# included [app]"))
        .stdout(predicate::str::contains("A -> B.call_c"))
        .stdout(predicate::str::contains("B -> C.call_d"));
}

#[test]
fn test_command_line_title_wins_over_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "title = \"from-config\"\nmodules = [\"A\"]\n");

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-c")
        .arg(&config)
        .arg("--title")
        .arg("from-cli")
        .arg(fixture("module_chain.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("# from-cli"))
        .stdout(predicate::str::contains("from-config").not());
}

#[test]
fn test_json_output() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, r#"modules = ["A", "Base"]"#);

    let output = Command::cargo_bin("diverdown")
        .unwrap()
        .arg("-c")
        .arg(&config)
        .arg("--title")
        .arg("subclass")
        .arg("--group")
        .arg("web")
        .arg("--format")
        .arg("json")
        .arg(fixture("subclass.json"))
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["title"], "subclass");
    assert_eq!(json["definition_group"], "web");

    let sources = json["sources"].as_array().unwrap();
    let names: Vec<&str> = sources
        .iter()
        .map(|source| source["source_name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["A", "B", "C"]);

    let a_deps = sources[0]["dependencies"].as_array().unwrap();
    assert_eq!(a_deps.len(), 1);
    assert_eq!(a_deps[0]["source_name"], "B");
    let method_ids = a_deps[0]["method_ids"].as_array().unwrap();
    assert_eq!(method_ids[0]["name"], "call_c");
    assert_eq!(method_ids[0]["context"], "instance");
    assert_eq!(method_ids[1]["name"], "new");
    assert_eq!(method_ids[1]["context"], "class");
    assert_eq!(method_ids[1]["paths"][0], "/app/subclass.rb:3");
}

#[test]
fn test_filter_expression_limits_traced_kinds() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, r#"modules = ["A", "Base"]"#);

    // Only native calls: B.new is seen but has no caller context
    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-c")
        .arg(&config)
        .arg("-e")
        .arg("trace=c")
        .arg(fixture("subclass.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\nB\n"))
        .stdout(predicate::str::contains("->").not());
}

#[test]
fn test_unpaired_filter_expression_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, r#"modules = ["A"]"#);

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-c")
        .arg(&config)
        .arg("-e")
        .arg("trace=call")
        .arg(fixture("module_chain.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to configure tracer"))
        .stderr(predicate::str::contains("call requires return"));
}

#[test]
fn test_malformed_filter_expression_is_rejected() {
    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-e")
        .arg("call,return")
        .arg(fixture("module_chain.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Expected format: trace=SPEC"));
}

#[test]
fn test_unknown_event_kind_is_rejected() {
    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-e")
        .arg("trace=line")
        .arg(fixture("module_chain.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("line"));
}

#[test]
fn test_missing_script() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.json");

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_invalid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "unknown_key = true\n");

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-c")
        .arg(&config)
        .arg(fixture("module_chain.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config"));
}

#[test]
fn test_unknown_module_in_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, r#"modules = ["Missing"]"#);

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("-c")
        .arg(&config)
        .arg(fixture("module_chain.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("uninitialized constant Missing"));
}

#[test]
fn test_invalid_program() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("program.json");
    fs::write(&script, r#"{ "calls": [ { "receiver": "Nope", "method": "x" } ] }"#).unwrap();

    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown module Nope"));
}

#[test]
fn test_no_targets_prints_only_header() {
    let mut cmd = Command::cargo_bin("diverdown").unwrap();
    cmd.arg("--title")
        .arg("empty")
        .arg(fixture("module_chain.json"))
        .assert()
        .success()
        .stdout("# empty\n");
}
