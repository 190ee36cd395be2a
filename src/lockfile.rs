use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::pipeline::StageSpec;
use crate::recipe::Recipe;
use crate::security::compute_sha256;

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub recipe_version: u32,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<StageLock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<RequirementLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageLock {
    pub name: String,
    pub kind: String,
    pub params_hash: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,
}

/// Digest of a requirements file a `venv` stage installs from.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequirementLock {
    pub stage: String,
    pub path: String,
    pub sha256: Option<String>,
}

pub fn build_lock(recipe: &Recipe) -> Result<PipelineLock> {
    let stages = recipe
        .stages
        .iter()
        .map(|spec| StageLock {
            name: spec.name.clone(),
            kind: spec.stage.clone(),
            params_hash: hash_params(spec),
            continue_on_error: spec.continue_on_error,
        })
        .collect();

    let workdir = recipe.resolve_workdir();
    let mut requirements = Vec::new();
    for spec in recipe.stages.iter().filter(|s| s.stage == "venv") {
        for path in requirement_files(spec) {
            let resolved = workdir.join(&path);
            let sha256 = if resolved.is_file() {
                Some(compute_sha256(&resolved)?)
            } else {
                None
            };
            requirements.push(RequirementLock {
                stage: spec.name.clone(),
                path,
                sha256,
            });
        }
    }

    Ok(PipelineLock {
        recipe_version: recipe.version,
        name: recipe.pipeline_name(),
        generated_at: Utc::now(),
        stages,
        requirements,
    })
}

pub fn generate_lock(recipe: &Recipe, path: &Path) -> Result<()> {
    let lock = build_lock(recipe)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

fn requirement_files(spec: &StageSpec) -> Vec<String> {
    let declared = spec
        .params
        .as_ref()
        .and_then(|params| params.get("requirements"));
    match declared {
        Some(Value::String(path)) => vec![path.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => vec!["requirements.txt".to_string()],
    }
}

fn hash_params(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    let value = Value::Object(spec.params.clone().unwrap_or_default());
    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    hasher.update(spec.stage.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}
