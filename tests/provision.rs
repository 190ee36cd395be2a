#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use mlsecops_runner::pipeline::{PipelineReport, RunOptions, StageRegistry, prepare_run};
use mlsecops_runner::recipe::Recipe;
use mlsecops_runner::stages::{self, REQUIREMENTS_MARKER};
use tempfile::tempdir;

// Creates venvs by copying itself; inside a venv it records pip and script calls.
const FAKE_PYTHON: &str = r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  echo "home = /usr/bin" > "$3/pyvenv.cfg"
  cp "$0" "$3/bin/python"
  exit 0
fi
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
  shift 2
  echo "pip $*" >> pip.log
  exit 0
fi
echo "python $* VIRTUAL_ENV=$VIRTUAL_ENV" >> python.log
"#;

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn run(recipe_path: &Path) -> PipelineReport {
    let recipe = Recipe::load(recipe_path).unwrap();
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    let (executor, mut ctx) = prepare_run(&recipe, &registry, &RunOptions::default()).unwrap();
    executor.execute(&mut ctx)
}

fn pip_calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("pip.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn dependencies_install_once_until_requirements_change() {
    let temp = tempdir().unwrap();
    let python = temp.path().join("bootstrap-python");
    write_executable(&python, FAKE_PYTHON);
    fs::write(temp.path().join("requirements.txt"), "pandas==2.2.0\n").unwrap();

    let recipe_path = temp.path().join("pipeline.yaml");
    fs::write(
        &recipe_path,
        format!(
            r#"
version: 1
stages:
  - name: provision
    stage: venv
    params:
      python: "{}"
      packages: [garak]
  - name: train
    stage: python
    params: {{ script: train.py }}
"#,
            python.display()
        ),
    )
    .unwrap();

    let first = run(&recipe_path);
    assert!(first.succeeded, "{:?}", first.stages);
    let summary = &first.outcome("provision").unwrap().summary;
    assert_eq!(summary["created"], serde_json::json!(true));
    assert_eq!(summary["installed"], serde_json::json!(true));

    let calls = pip_calls(temp.path());
    assert_eq!(calls.len(), 2, "{calls:?}");
    assert!(calls[0].starts_with("pip install -r "));
    assert!(calls[0].ends_with("requirements.txt"));
    assert_eq!(calls[1], "pip install garak");

    let venv = temp.path().canonicalize().unwrap().join(".venv");
    assert!(venv.join(REQUIREMENTS_MARKER).is_file());
    let python_log = fs::read_to_string(temp.path().join("python.log")).unwrap();
    assert!(python_log.contains("python train.py"));
    assert!(python_log.contains(&format!("VIRTUAL_ENV={}", venv.display())));

    let second = run(&recipe_path);
    assert!(second.succeeded);
    let summary = &second.outcome("provision").unwrap().summary;
    assert_eq!(summary["created"], serde_json::json!(false));
    assert_eq!(summary["installed"], serde_json::json!(false));
    assert_eq!(pip_calls(temp.path()).len(), 2);

    fs::write(temp.path().join("requirements.txt"), "pandas==2.2.1\n").unwrap();
    let third = run(&recipe_path);
    assert!(third.succeeded);
    assert_eq!(
        third.outcome("provision").unwrap().summary["installed"],
        serde_json::json!(true)
    );
    assert_eq!(pip_calls(temp.path()).len(), 4);
}

#[test]
fn explicit_missing_requirements_file_fails_provisioning() {
    let temp = tempdir().unwrap();
    let python = temp.path().join("bootstrap-python");
    write_executable(&python, FAKE_PYTHON);

    let recipe_path = temp.path().join("pipeline.yaml");
    fs::write(
        &recipe_path,
        format!(
            r#"
version: 1
stages:
  - name: provision
    stage: venv
    params:
      python: "{}"
      requirements: [requirements-dev.txt]
  - name: train
    stage: python
    params: {{ script: train.py }}
"#,
            python.display()
        ),
    )
    .unwrap();

    let report = run(&recipe_path);
    assert!(!report.succeeded);
    assert_eq!(report.failed_stage.as_deref(), Some("provision"));
    let error = report.outcome("provision").unwrap().error.clone().unwrap();
    assert!(error.contains("requirements-dev.txt"), "{error}");
    assert!(!temp.path().join("python.log").exists());
}
