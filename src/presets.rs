use anyhow::{Context, Result};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const PRESETS: &[&str] = &["mlsecops", "minimal"];

#[derive(Debug, Clone, Serialize)]
struct PresetRecipe {
    version: u32,
    name: String,
    #[serde(skip_serializing_if = "Mapping::is_empty")]
    env: Mapping,
    stages: Vec<StageEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct StageEntry {
    name: String,
    stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    continue_on_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_if: Option<String>,
}

impl StageEntry {
    fn tolerant(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    fn skip_if(mut self, flag: &str) -> Self {
        self.skip_if = Some(flag.into());
        self
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = match name {
        "mlsecops" => mlsecops_preset(),
        "minimal" => minimal_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// Provision, train, scan, audit, publish and archive.
fn mlsecops_preset() -> PresetRecipe {
    PresetRecipe {
        version: 1,
        name: "mlsecops".into(),
        env: env(&[
            ("MLFLOW_TRACKING_URI", "${MLFLOW_TRACKING_URI:-file:./mlruns}"),
            ("MODEL_NAME", "${MODEL_NAME:-sshleifer/tiny-gpt2}"),
            ("SAMPLES", "${SAMPLES:-400}"),
            ("DVC_REMOTE", "${DVC_REMOTE:-storage}"),
            ("TARGET_BRANCH", "${TARGET_BRANCH:-main}"),
        ]),
        stages: vec![
            stage(
                "provision",
                "venv",
                params(vec![
                    ("path", val_str(".venv")),
                    ("requirements", val_list(&["requirements.txt"])),
                    ("upgrade_pip", Value::Bool(true)),
                ]),
            ),
            stage(
                "pull-data",
                "data-pull",
                params(vec![("remote", val_str("${DVC_REMOTE}"))]),
            )
            .tolerant(),
            stage(
                "train",
                "python",
                params(vec![
                    ("script", val_str("train.py")),
                    ("args", val_list(&["--samples", "${SAMPLES}"])),
                    ("metrics_file", val_str("artifacts/metrics.json")),
                    ("log", val_str("artifacts/logs/train.log")),
                ]),
            ),
            stage(
                "garak-scan",
                "garak",
                params(vec![
                    ("model_name", val_str("${MODEL_NAME}")),
                    ("output_dir", val_str("artifacts/mlsecops")),
                ]),
            )
            .skip_if("SKIP_GARAK"),
            stage(
                "data-audit",
                "data-audit",
                params(vec![
                    ("train", val_str("artifacts/data/train.csv")),
                    ("test", val_str("artifacts/data/test.csv")),
                    ("label", val_str("label")),
                    ("numeric", val_list(&["tenure", "monthly_charges"])),
                    ("categorical", val_list(&["region", "customer_segment"])),
                    ("output_dir", val_str("artifacts/mlsecops")),
                ]),
            ),
            stage(
                "fairness",
                "fairness",
                params(vec![
                    ("predictions", val_str("artifacts/predictions.csv")),
                    ("sensitive_features", val_list(&["region", "customer_segment"])),
                ]),
            ),
            stage("sbom", "sbom", params(vec![("format", val_str("json"))])),
            stage(
                "governance",
                "governance",
                params(vec![
                    ("evaluation", val_str("train")),
                    ("fairness", val_str("fairness")),
                    ("security", val_str("data-audit")),
                    ("sbom", val_str("sbom")),
                ]),
            ),
            stage(
                "track-artifacts",
                "dvc-track",
                params(vec![
                    ("paths", val_list(&["artifacts"])),
                    ("remote", val_str("${DVC_REMOTE}")),
                    ("push", Value::Bool(true)),
                ]),
            )
            .tolerant(),
            stage(
                "publish",
                "git-publish",
                params(vec![
                    ("paths", val_list(&["artifacts"])),
                    ("message", val_str("Update MLSecOps artifacts")),
                    ("branch", val_str("${TARGET_BRANCH}")),
                    ("push", Value::Bool(true)),
                ]),
            )
            .tolerant(),
            stage(
                "archive",
                "archive",
                params(vec![
                    ("paths", val_list(&["artifacts", "mlruns"])),
                    ("destination", val_str("dist")),
                    ("name", val_str("mlsecops-artifacts.zip")),
                ]),
            ),
        ],
    }
}

fn minimal_preset() -> PresetRecipe {
    PresetRecipe {
        version: 1,
        name: "minimal".into(),
        env: Mapping::new(),
        stages: vec![
            stage("provision", "venv", None),
            stage(
                "train",
                "python",
                params(vec![("script", val_str("train.py"))]),
            ),
            stage(
                "archive",
                "archive",
                params(vec![("paths", val_list(&["artifacts"]))]),
            ),
        ],
    }
}

fn stage(name: &str, kind: &str, params: Option<BTreeMap<String, Value>>) -> StageEntry {
    StageEntry {
        name: name.into(),
        stage: kind.into(),
        params,
        continue_on_error: false,
        skip_if: None,
    }
}

fn params(entries: Vec<(&str, Value)>) -> Option<BTreeMap<String, Value>> {
    Some(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
}

fn env(entries: &[(&str, &str)]) -> Mapping {
    entries
        .iter()
        .map(|(k, v)| (val_str(k), val_str(v)))
        .collect()
}

fn val_str(value: &str) -> Value {
    Value::String(value.to_string())
}

fn val_list(values: &[&str]) -> Value {
    Value::Sequence(values.iter().map(|v| val_str(v)).collect())
}
