//! CLI integration tests for the Gatehouse command-line interface.
//!
//! Help and parsing tests run without a pipeline root; the workflow test
//! drives a real root in a temp directory, one process per command.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

const DEFINITION: &str = r#"
[pipeline]
id = "blog"
name = "Blog"
order = ["outline", "draft"]

[[checkpoints]]
id = "outline"
name = "Outline"

[checkpoints.mode]
type = "human_only"
instructions = "Pick a topic"

[[checkpoints.mode.input_fields]]
name = "topic"
type = "text"
required = true

[[checkpoints]]
id = "draft"
name = "Draft"
mode = { type = "agentic", prompt = "Write the post" }
inputs = { include_checkpoint_outputs = ["outline"] }
"#;

/// A gatehouse command isolated from the user's config files.
fn gatehouse(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("gatehouse").unwrap();
    cmd.current_dir(home)
        .env("GATEHOUSE_CONFIG_DIR", home.join("config"))
        .env_remove("GATEHOUSE_ROOT")
        .env_remove("GATEHOUSE_PIPELINE")
        .env_remove("RUST_LOG");
    cmd
}

fn json(home: &Path, args: &[&str]) -> Value {
    let root = home.join("blog");
    let output = gatehouse(home)
        .arg("--root")
        .arg(&root)
        .arg("--json")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    gatehouse(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("rollback"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("prune"));
}

#[test]
fn test_version_displays() {
    let home = TempDir::new().unwrap();
    gatehouse(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("gatehouse"));
}

#[test]
fn test_exec_subcommands_listed() {
    let home = TempDir::new().unwrap();
    gatehouse(home.path())
        .args(["exec", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("approve-start"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("revise"))
        .stdout(predicate::str::contains("complete"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let home = TempDir::new().unwrap();
    gatehouse(home.path()).arg("frobnicate").assert().failure();
}

#[test]
fn test_missing_pipeline_selection_fails() {
    let home = TempDir::new().unwrap();
    gatehouse(home.path())
        .args(["run", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--pipeline"));
}

#[test]
fn test_config_which_reports_sources() {
    let home = TempDir::new().unwrap();
    gatehouse(home.path())
        .args(["config", "which"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gatehouse.toml"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflow
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_full_run_through_the_cli() {
    let home = TempDir::new().unwrap();
    let home = home.path();
    let definition = home.join("blog.toml");
    std::fs::write(&definition, DEFINITION).unwrap();

    let init = json(home, &["init", definition.to_str().unwrap()]);
    assert_eq!(init["pipeline_id"], "blog");
    assert!(home.join("blog/.pipeline_system/definitions/blog.toml").is_file());

    let run = json(home, &["run", "create"]);
    assert_eq!(run["run_version"], 1);

    let started = json(home, &["run", "start", "v1"]);
    assert_eq!(started["run"]["status"], "in_progress");
    let outline = started["current_execution"]["id"].as_str().unwrap().to_string();

    let submitted = json(home, &["exec", "submit", &outline, "-f", "topic=rust"]);
    assert_eq!(submitted["status"], "completed");

    // The agentic draft is deferred to an external executor.
    let shown = json(home, &["run", "show", "1"]);
    let draft = &shown["summary"]["current_execution"];
    assert_eq!(draft["checkpoint_id"], "draft");
    assert_eq!(draft["status"], "in_progress");
    let draft = draft["id"].as_str().unwrap().to_string();

    let body = home.join("post.md");
    std::fs::write(&body, "# Rust").unwrap();
    let artifact = format!("draft={}", body.display());
    let completed = json(home, &["exec", "complete", &draft, "-a", &artifact]);
    assert_eq!(completed["status"], "completed");

    let shown = json(home, &["run", "show", "v1"]);
    assert_eq!(shown["summary"]["run"]["status"], "completed");
    assert!(home.join("blog/runs/v1/checkpoint_1_Draft/outputs").is_dir());

    let check = json(home, &["check"]);
    assert_eq!(check["drifts"].as_array().unwrap().len(), 0);
}

#[test]
fn test_errors_map_to_exit_codes() {
    let home = TempDir::new().unwrap();
    let home = home.path();
    let definition = home.join("blog.toml");
    std::fs::write(&definition, DEFINITION).unwrap();
    json(home, &["init", definition.to_str().unwrap()]);

    gatehouse(home)
        .arg("--root")
        .arg(home.join("blog"))
        .args(["exec", "approve", "missing"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("not_found"));

    json(home, &["run", "create"]);
    gatehouse(home)
        .arg("--root")
        .arg(home.join("blog"))
        .args(["run", "pause", "v1"])
        .assert()
        .code(3);
}
