use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn runner() -> Command {
    Command::cargo_bin("mlsecops-runner").expect("binary present")
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn write(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
}

#[test]
fn list_stages_prints_every_builtin() {
    let output = runner().arg("list-stages").output().unwrap();
    assert!(output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.starts_with("Available stages:"));
    for stage in [
        "archive",
        "command",
        "data-audit",
        "data-pull",
        "dvc-track",
        "fairness",
        "garak",
        "git-publish",
        "governance",
        "python",
        "sbom",
        "venv",
    ] {
        assert!(stdout.contains(&format!("- {stage}\n")), "missing {stage}");
    }
}

#[test]
fn generated_preset_validates_and_locks() {
    let temp = tempdir().unwrap();

    runner()
        .current_dir(temp.path())
        .args(["recipe", "new", "--preset", "mlsecops"])
        .assert()
        .success();
    let recipe = temp.path().join("recipes/mlsecops.yaml");
    assert!(recipe.is_file());

    runner()
        .current_dir(temp.path())
        .args(["validate", "recipes/mlsecops.yaml"])
        .assert()
        .success();

    runner()
        .current_dir(temp.path())
        .args(["lock", "recipes/mlsecops.yaml", "locks/mlsecops.lock"])
        .assert()
        .success();
    let lock = fs::read_to_string(temp.path().join("locks/mlsecops.lock")).unwrap();
    assert!(lock.contains("kind: garak"));
}

#[test]
fn invalid_recipe_fails_validation() {
    let temp = tempdir().unwrap();
    write(
        &temp.path().join("broken.yaml"),
        "version: 1\nstages:\n  - { name: x, stage: teleport }\n",
    );

    let output = runner()
        .current_dir(temp.path())
        .args(["validate", "broken.yaml"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown stage kind 'teleport'"), "{stderr}");
    assert!(stderr.contains("Recipe validation failed with 1 error(s)"), "{stderr}");
}

#[test]
fn dry_run_prints_the_plan_without_running() {
    let temp = tempdir().unwrap();
    write(
        &temp.path().join("pipeline.yaml"),
        r#"
version: 1
secrets: [MLSECOPS_CLI_TEST_TOKEN]
stages:
  - { name: greet, stage: command, params: { shell: "echo hi > greeted.txt" } }
  - { name: scan, stage: command, skip_if: SKIP_SCAN, params: { program: garak } }
  - { name: publish, stage: command, continue_on_error: true, params: { program: git } }
"#,
    );

    let output = runner()
        .current_dir(temp.path())
        .args(["run", "pipeline.yaml", "--dry-run", "--skip", "publish"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = stdout_of(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "{stdout}");
    assert!(lines[0].starts_with("1. greet [command]"));
    assert!(lines[1].ends_with("(skip if SKIP_SCAN)"));
    assert!(lines[2].ends_with("(continue on error) (skipped)"));
    assert!(!temp.path().join("greeted.txt").exists());
}

#[test]
fn dry_run_plan_masks_secret_values() {
    let temp = tempdir().unwrap();
    write(
        &temp.path().join("pipeline.yaml"),
        r#"
version: 1
secrets: [API_TOKEN]
stages:
  - name: push
    stage: command
    params: { program: curl, args: ["-H", "token: ${API_TOKEN}", "https://models.example"] }
"#,
    );

    let output = runner()
        .current_dir(temp.path())
        .args(["run", "pipeline.yaml", "--dry-run", "--set", "API_TOKEN=hunter2"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = stdout_of(&output);
    assert!(stdout.starts_with("1. push [command] curl"), "{stdout}");
    assert!(stdout.contains("token: ***"), "{stdout}");
    assert!(!stdout.contains("hunter2"), "{stdout}");
    assert!(!String::from_utf8_lossy(&output.stderr).contains("hunter2"));
}

#[test]
fn failing_run_writes_report_and_exits_nonzero() {
    let temp = tempdir().unwrap();
    write(
        &temp.path().join("pipeline.yaml"),
        r#"
version: 1
name: broken
stages:
  - { name: tool, stage: command, params: { program: mlsecops-runner-missing-tool } }
  - { name: after, stage: command, params: { program: mlsecops-runner-missing-tool } }
"#,
    );

    let output = runner()
        .current_dir(temp.path())
        .args([
            "run",
            "pipeline.yaml",
            "--report",
            "out/report.json",
            "--metrics-prometheus",
            "out/metrics.prom",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Pipeline 'broken' failed at stage 'tool'"),
        "{stderr}"
    );

    let report: Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("out/report.json")).unwrap())
            .unwrap();
    assert_eq!(report["succeeded"], Value::Bool(false));
    assert_eq!(report["failed_stage"], "tool");
    assert_eq!(report["stages"][0]["status"], "failed");
    assert_eq!(report["stages"][1]["status"], "not_run");
    assert!(
        report["stages"][0]["error"]
            .as_str()
            .unwrap()
            .contains("was not found on PATH")
    );

    let metrics = fs::read_to_string(temp.path().join("out/metrics.prom")).unwrap();
    assert!(metrics.contains("mlsecops_stage_outcomes_total{status=\"failed\"} 1"));
}

#[test]
fn security_digest_prints_sha256() {
    let temp = tempdir().unwrap();
    write(&temp.path().join("model.bin"), "mlsecops");

    let output = runner()
        .current_dir(temp.path())
        .args([
            "security",
            "digest",
            "--path",
            "model.bin",
            "--output",
            "model.bin.sha256",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let digest = "05d76492e8f246ad99f68bca38d8a568286343267353ce47bb13f95e9967131b";
    assert_eq!(stdout_of(&output).trim(), format!("{digest}  model.bin"));
    let written = fs::read_to_string(temp.path().join("model.bin.sha256")).unwrap();
    assert!(written.contains(digest));
}

#[test]
fn recipe_diff_reports_changed_stages() {
    let temp = tempdir().unwrap();
    write(
        &temp.path().join("left.yaml"),
        "version: 1\nstages:\n  - { name: train, stage: python, params: { script: train.py } }\n",
    );
    write(
        &temp.path().join("right.yaml"),
        "version: 1\nstages:\n  - { name: train, stage: python, params: { script: fit.py } }\n  - { name: sbom, stage: sbom }\n",
    );

    let output = runner()
        .current_dir(temp.path())
        .args(["recipe", "diff", "left.yaml", "right.yaml"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Stage 1 ('train') parameters differ"), "{stdout}");
    assert!(stdout.contains("Extra stage in right recipe at position 2: 'sbom' (sbom)"));

    runner()
        .current_dir(temp.path())
        .args(["recipe", "diff", "left.yaml", "left.yaml"])
        .assert()
        .success();
}

#[test]
fn completions_are_generated() {
    let output = runner().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("mlsecops-runner"));
}
