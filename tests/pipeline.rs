use std::fs;
use std::path::Path;

use mlsecops_runner::pipeline::{
    PipelineReport, RunOptions, StageRegistry, StageSpec, StageStatus, build_pipeline,
    prepare_run,
};
use mlsecops_runner::config::RunEnvironment;
use mlsecops_runner::recipe::Recipe;
use mlsecops_runner::stages;
use tempfile::tempdir;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn write_recipe(dir: &Path, yaml: &str) -> Recipe {
    let path = dir.join("pipeline.yaml");
    fs::write(&path, yaml).unwrap();
    Recipe::load(&path).unwrap()
}

fn run(recipe: &Recipe, options: RunOptions) -> PipelineReport {
    let registry = build_registry();
    let (executor, mut ctx) = prepare_run(recipe, &registry, &options).unwrap();
    executor.execute(&mut ctx)
}

#[test]
fn duplicate_stage_names_are_rejected() {
    let registry = build_registry();
    let mut spec = StageSpec::new("same", "command");
    spec.params = Some(
        serde_json::json!({"program": "true"})
            .as_object()
            .cloned()
            .unwrap(),
    );
    let err = build_pipeline(
        &registry,
        &[spec.clone(), spec],
        &RunEnvironment::default(),
        &[],
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("Duplicate stage name 'same'"));
}

#[test]
fn skipping_an_unknown_stage_is_an_error() {
    let registry = build_registry();
    let mut spec = StageSpec::new("only", "command");
    spec.params = Some(
        serde_json::json!({"program": "true"})
            .as_object()
            .cloned()
            .unwrap(),
    );
    let err = build_pipeline(
        &registry,
        &[spec],
        &RunEnvironment::default(),
        &["ghost".to_string()],
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn missing_secret_prevents_the_run() {
    let temp = tempdir().unwrap();
    let recipe = write_recipe(
        temp.path(),
        r#"
version: 1
secrets: [MLSECOPS_TEST_MISSING_SECRET]
stages:
  - { name: noop, stage: command, params: { program: "true" } }
"#,
    );
    let err = prepare_run(&recipe, &build_registry(), &RunOptions::default())
        .err()
        .unwrap();
    assert!(
        err.to_string()
            .contains("Required secret 'MLSECOPS_TEST_MISSING_SECRET' is not set")
    );

    let dry = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    assert!(prepare_run(&recipe, &build_registry(), &dry).is_ok());
}

#[cfg(unix)]
mod unix {
    use super::*;

    #[test]
    fn stages_run_in_declared_order() {
        let temp = tempdir().unwrap();
        let recipe = write_recipe(
            temp.path(),
            r#"
version: 1
stages:
  - { name: first, stage: command, params: { shell: "echo first >> order.txt" } }
  - { name: second, stage: command, params: { shell: "echo second >> order.txt" } }
  - { name: third, stage: command, params: { program: sh, args: ["-c", "echo third >> order.txt"] } }
"#,
        );

        let report = run(&recipe, RunOptions::default());
        assert!(report.succeeded);
        assert_eq!(
            report.statuses(),
            vec![
                ("first", StageStatus::Succeeded),
                ("second", StageStatus::Succeeded),
                ("third", StageStatus::Succeeded),
            ]
        );
        let order = fs::read_to_string(temp.path().join("order.txt")).unwrap();
        assert_eq!(order, "first\nsecond\nthird\n");
    }

    #[test]
    fn failing_stage_halts_the_pipeline() {
        let temp = tempdir().unwrap();
        let recipe = write_recipe(
            temp.path(),
            r#"
version: 1
stages:
  - { name: install, stage: command, params: { shell: "echo install >> order.txt" } }
  - { name: train, stage: command, params: { shell: "echo boom >&2; exit 7" } }
  - { name: scan, stage: command, params: { shell: "echo scan >> order.txt" } }
  - { name: publish, stage: command, params: { shell: "echo publish >> order.txt" } }
"#,
        );

        let report = run(&recipe, RunOptions::default());
        assert!(!report.succeeded);
        assert_eq!(report.failed_stage.as_deref(), Some("train"));
        assert_eq!(
            report.statuses(),
            vec![
                ("install", StageStatus::Succeeded),
                ("train", StageStatus::Failed),
                ("scan", StageStatus::NotRun),
                ("publish", StageStatus::NotRun),
            ]
        );
        let error = report.outcome("train").unwrap().error.clone().unwrap();
        assert!(error.contains("exited with status 7"), "{error}");
        let order = fs::read_to_string(temp.path().join("order.txt")).unwrap();
        assert_eq!(order, "install\n");
    }

    #[test]
    fn tolerated_failure_does_not_halt_the_pipeline() {
        let temp = tempdir().unwrap();
        let recipe = write_recipe(
            temp.path(),
            r#"
version: 1
stages:
  - name: pull
    stage: command
    continue_on_error: true
    params: { shell: "exit 1" }
  - { name: train, stage: command, params: { shell: "echo train >> order.txt" } }
"#,
        );

        let report = run(&recipe, RunOptions::default());
        assert!(report.succeeded);
        assert_eq!(report.outcome("pull").unwrap().status, StageStatus::Tolerated);
        assert_eq!(report.outcome("train").unwrap().status, StageStatus::Succeeded);
        assert!(temp.path().join("order.txt").is_file());
    }

    #[test]
    fn skipped_stages_never_run() {
        let temp = tempdir().unwrap();
        let recipe = write_recipe(
            temp.path(),
            r#"
version: 1
stages:
  - name: scan
    stage: command
    skip_if: SKIP_SCAN
    params: { shell: "echo scan >> order.txt" }
  - { name: audit, stage: command, params: { shell: "echo audit >> order.txt" } }
  - { name: publish, stage: command, params: { shell: "echo publish >> order.txt" } }
"#,
        );

        let options = RunOptions {
            overrides: vec![("SKIP_SCAN".into(), "yes".into())],
            skip: vec!["publish".into()],
            ..RunOptions::default()
        };
        let report = run(&recipe, options);
        assert!(report.succeeded);
        assert_eq!(
            report.statuses(),
            vec![
                ("scan", StageStatus::Skipped),
                ("audit", StageStatus::Succeeded),
                ("publish", StageStatus::Skipped),
            ]
        );
        let order = fs::read_to_string(temp.path().join("order.txt")).unwrap();
        assert_eq!(order, "audit\n");
    }

    #[test]
    fn metrics_cover_executed_stages() {
        let temp = tempdir().unwrap();
        let recipe = write_recipe(
            temp.path(),
            r#"
version: 1
stages:
  - { name: ok, stage: command, params: { program: "true" } }
  - { name: flaky, stage: command, continue_on_error: true, params: { program: "false" } }
  - { name: off, stage: command, skip_if: ALWAYS, params: { program: "true" } }
"#,
        );
        let registry = build_registry();
        let options = RunOptions {
            overrides: vec![("ALWAYS".into(), "1".into())],
            ..RunOptions::default()
        };
        let (executor, mut ctx) = prepare_run(&recipe, &registry, &options).unwrap();
        executor.execute(&mut ctx);

        let snapshot = executor.metrics().snapshot();
        assert_eq!(snapshot.stages_succeeded, 1);
        assert_eq!(snapshot.stages_tolerated, 1);
        assert_eq!(snapshot.stages_skipped, 1);
        assert_eq!(snapshot.stages_failed, 0);
        assert_eq!(snapshot.stages.get("ok").map(|m| m.calls), Some(1));
        assert!(!snapshot.stages.contains_key("off"));
        assert!(
            snapshot
                .to_prometheus()
                .contains("mlsecops_stage_outcomes_total{status=\"tolerated\"} 1")
        );
    }

    #[test]
    fn environment_layers_reach_child_processes() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(".env"), "FROM_FILE=file\nOVERRIDDEN=file\n").unwrap();
        let recipe = write_recipe(
            temp.path(),
            r#"
version: 1
env:
  GREETING: "hello-${FROM_FILE}"
  OVERRIDDEN: recipe
  SAMPLES: "${MLSECOPS_TEST_UNSET_SAMPLES:-400}"
stages:
  - name: show
    stage: command
    params:
      shell: 'echo "$GREETING $OVERRIDDEN $SAMPLES" > env.txt'
"#,
        );
        let options = RunOptions {
            overrides: vec![("OVERRIDDEN".into(), "cli".into())],
            ..RunOptions::default()
        };
        let report = run(&recipe, options);
        assert!(report.succeeded, "{:?}", report.stages);
        let written = fs::read_to_string(temp.path().join("env.txt")).unwrap();
        assert_eq!(written.trim(), "hello-file cli 400");
    }

    #[test]
    fn secrets_are_masked_in_summaries_and_logs() {
        let temp = tempdir().unwrap();
        let recipe = write_recipe(
            temp.path(),
            r#"
version: 1
secrets: [API_TOKEN]
stages:
  - name: leak
    stage: command
    params:
      program: sh
      args: ["-c", "echo token=${API_TOKEN}"]
      log: logs/leak.log
"#,
        );
        let options = RunOptions {
            overrides: vec![("API_TOKEN".into(), "hunter2".into())],
            ..RunOptions::default()
        };
        let report = run(&recipe, options);
        assert!(report.succeeded);
        let summary = &report.outcome("leak").unwrap().summary;
        let command = summary["command"].as_str().unwrap();
        assert!(!command.contains("hunter2"));
        assert!(command.contains("***"));

        let log = fs::read_to_string(temp.path().join("logs/leak.log")).unwrap();
        assert!(log.contains("token=***"));
        assert!(!log.contains("hunter2"));
    }

    #[test]
    fn python_stage_reads_metrics_file() {
        let temp = tempdir().unwrap();
        let script = temp.path().join("fake-python");
        fs::write(
            &script,
            "#!/bin/sh\nmkdir -p artifacts\necho '{\"accuracy\": 0.9}' > artifacts/metrics.json\n",
        )
        .unwrap();
        make_executable(&script);
        let recipe = write_recipe(
            temp.path(),
            &format!(
                r#"
version: 1
stages:
  - name: train
    stage: python
    params:
      python: "{}"
      script: train.py
      metrics_file: artifacts/metrics.json
"#,
                script.display()
            ),
        );
        let report = run(&recipe, RunOptions::default());
        assert!(report.succeeded, "{:?}", report.stages);
        let summary = &report.outcome("train").unwrap().summary;
        assert_eq!(summary["metrics"]["accuracy"], serde_json::json!(0.9));
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }
}
