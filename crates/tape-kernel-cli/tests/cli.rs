use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn run_cli(args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_tape-kernel"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("spawn cli: {err}"));
    assert!(
        output.status.success(),
        "cli failed: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr),
    );
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "parse cli output: {err}\nstdout: {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn write_config(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write config: {err}"));
    path.display().to_string()
}

#[test]
fn run_inspect_fork_and_export() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let config = write_config(
        dir.path(),
        "simple.yaml",
        "agent:\n  name: demo\n  kind: simple\n",
    );
    let db = dir.path().join("tapes.db").display().to_string();

    let summary = run_cli(&[
        "run",
        "--agent-config",
        &config,
        "--tape-db",
        &db,
        "--context",
        r#"{"task":"demo"}"#,
        "--cycles",
        "2",
    ]);
    assert_eq!(summary["cycles_completed"], 2);
    assert_eq!(summary["steps"], 6);
    let tape_id = summary["tape_id"]
        .as_str()
        .unwrap_or_else(|| panic!("missing tape_id in {summary}"))
        .to_string();

    let listed = run_cli(&["tape", "list", "--tape-db", &db]);
    assert_eq!(listed["tapes"], serde_json::json!([tape_id]));

    let shown = run_cli(&["tape", "show", "--tape-db", &db, "--tape-id", &tape_id]);
    let steps = shown["steps"]
        .as_array()
        .unwrap_or_else(|| panic!("missing steps in {shown}"));
    assert_eq!(steps.len(), 6);
    assert_eq!(steps[0]["type"], "thought");
    assert_eq!(steps[0]["metadata"]["node"], "think");

    // Continue on a fork of the saved tape.
    let forked = run_cli(&[
        "run",
        "--agent-config",
        &config,
        "--tape-db",
        &db,
        "--context",
        r#"{"task":"continue"}"#,
        "--parent-tape",
        &tape_id,
    ]);
    assert_eq!(forked["steps"], 9);
    let fork_id = forked["tape_id"]
        .as_str()
        .unwrap_or_else(|| panic!("missing tape_id in {forked}"))
        .to_string();
    assert_ne!(fork_id, tape_id);

    let history = run_cli(&["tape", "history", "--tape-db", &db, "--tape-id", &fork_id]);
    assert_eq!(history["history"], serde_json::json!([fork_id, tape_id]));

    let searched = run_cli(&["tape", "search", "--tape-db", &db, "--agent", "demo"]);
    let found = searched["tapes"]
        .as_array()
        .unwrap_or_else(|| panic!("missing tapes in {searched}"));
    assert_eq!(found.len(), 2);

    let out = dir.path().join("export.json").display().to_string();
    let exported = run_cli(&[
        "export", "--tape-db", &db, "--tape-id", &tape_id, "--out", &out,
    ]);
    assert_eq!(exported["tape_id"], tape_id);
    let document: Value = serde_json::from_str(
        &std::fs::read_to_string(&out).unwrap_or_else(|err| panic!("read export: {err}")),
    )
    .unwrap_or_else(|err| panic!("parse export: {err}"));
    assert_eq!(document["manifest"]["steps"], 6);
    let hash = document["manifest"]["content_hash"]
        .as_str()
        .unwrap_or_else(|| panic!("missing content_hash in {document}"));
    assert_eq!(hash.len(), 64);
}

#[test]
fn tool_agent_records_the_thought_even_when_the_act_phase_fails() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    // The unscripted mock provider never produces a parseable tool choice,
    // so the cycle stops after think; the tape still gets saved.
    let config = write_config(
        dir.path(),
        "tool.yaml",
        "agent:\n  name: operator\n  kind: tool\n  max_retries: 1\n\
         provider:\n  provider_name: mock\n  model: test-model\n\
         tools:\n  - echo\n  - utc_now\n",
    );
    let db = dir.path().join("tapes.db").display().to_string();

    let summary = run_cli(&[
        "run",
        "--agent-config",
        &config,
        "--tape-db",
        &db,
        "--context",
        r#"{"task":"echo something"}"#,
    ]);
    assert_eq!(summary["cycles_completed"], 0);
    assert_eq!(summary["steps"], 1);
    assert!(summary["error"].is_string(), "{summary}");
}
