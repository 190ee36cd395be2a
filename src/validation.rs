use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::config::{interpolate_lenient, interpolate_value_lenient, is_valid_name};
use crate::pipeline::{StageRegistry, StageSpec};
use crate::recipe::Recipe;
use crate::stages::assurance::governance_sources;

const PYTHON_STAGES: &[&str] = &["python", "garak", "sbom"];

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks over a recipe. Undefined variables are only warnings here
/// because an env file or `--set` may supply them at run time.
pub fn validate_recipe(recipe: &Recipe, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let env = match recipe.env_pairs() {
        Ok(pairs) => pairs,
        Err(err) => {
            report.errors.push(err.to_string());
            Vec::new()
        }
    };
    let (resolved_env, env_report) = resolve_env_leniently(&env);
    report.merge(env_report);
    report.merge(validate_secrets(recipe, &env));

    let lookup = |name: &str| {
        resolved_env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    };

    let mut seen = HashSet::new();
    for (idx, stage) in recipe.stages.iter().enumerate() {
        let label = if stage.name.trim().is_empty() {
            format!("Stage {}", idx + 1)
        } else {
            format!("Stage {} ('{}')", idx + 1, stage.name)
        };

        if stage.name.trim().is_empty() {
            report.errors.push(format!("{label}: name cannot be empty"));
        } else if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("{label}: duplicate stage name '{}'", stage.name));
        }

        if let Some(flag) = &stage.skip_if
            && !is_valid_name(flag)
        {
            report.errors.push(format!(
                "{label}: skip_if '{flag}' is not a valid environment variable name"
            ));
        }

        let mut stage_report = validate_stage(stage, registry, &lookup);
        stage_report.merge(validate_stage_order(idx, stage, &recipe.stages));
        for message in stage_report.errors {
            report.errors.push(format!("{label}: {message}"));
        }
        for message in stage_report.warnings {
            report.warnings.push(format!("{label}: {message}"));
        }
    }

    report
}

fn resolve_env_leniently(env: &[(String, String)]) -> (BTreeMap<String, String>, ValidationReport) {
    let mut report = ValidationReport::default();
    let mut resolved: BTreeMap<String, String> = BTreeMap::new();
    for (key, raw) in env {
        if !is_valid_name(key) {
            report.errors.push(format!(
                "Env key '{key}' is not a valid environment variable name"
            ));
        }
        let (value, missing) = interpolate_lenient(raw, |name| {
            resolved
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
        });
        for name in missing {
            report.warnings.push(format!(
                "Env '{key}' references undefined variable '{name}'"
            ));
        }
        resolved.insert(key.clone(), value);
    }
    (resolved, report)
}

fn validate_secrets(recipe: &Recipe, env: &[(String, String)]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();
    for secret in &recipe.secrets {
        if !is_valid_name(secret) {
            report.errors.push(format!(
                "Secret '{secret}' is not a valid environment variable name"
            ));
        }
        if !seen.insert(secret.as_str()) {
            report.errors.push(format!("Secret '{secret}' is listed twice"));
        }
        if env.iter().any(|(key, _)| key == secret) {
            report.errors.push(format!(
                "Secret '{secret}' must not be given a value in the recipe env block"
            ));
        }
    }
    report
}

fn validate_stage<F>(stage: &StageSpec, registry: &StageRegistry, lookup: &F) -> ValidationReport
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = ValidationReport::default();

    if !registry.contains(&stage.stage) {
        report.errors.push(format!(
            "Unknown stage kind '{}'. Available stages: {}",
            stage.stage,
            registry.known_stages().join(", ")
        ));
        return report;
    }

    let mut params = Value::Object(stage.params.clone().unwrap_or_default());
    let mut missing = Vec::new();
    interpolate_value_lenient(&mut params, lookup, &mut missing);
    for name in &missing {
        report
            .warnings
            .push(format!("parameters reference undefined variable '{name}'"));
    }

    let params = match params {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    if let Err(err) = registry.create(&stage.stage, params) {
        let message = format!("{:#}", err.context("Failed to instantiate stage"));
        // Undefined variables were blanked out, so the failure may be theirs.
        if missing.is_empty() {
            report.errors.push(message);
        } else {
            report.warnings.push(message);
        }
    }

    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, stages: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let earlier = &stages[..idx];

    if PYTHON_STAGES.contains(&stage.stage.as_str())
        && !earlier.iter().any(|prev| prev.stage == "venv")
        && !stage
            .params
            .as_ref()
            .is_some_and(|params| params.contains_key("python"))
    {
        report.warnings.push(
            "no venv stage runs earlier; the system Python interpreter will be used".into(),
        );
    }

    if stage.stage == "governance"
        && let Some(params) = &stage.params
    {
        for (source, name) in governance_sources(params) {
            if !earlier.iter().any(|prev| prev.name == name) {
                report.warnings.push(format!(
                    "governance source '{source}' names '{name}', which does not run earlier; it will be reported as skipped"
                ));
            }
        }
    }

    if stage.stage == "git-publish" && !stage.continue_on_error {
        report.warnings.push(
            "git-publish usually sets continue_on_error so a rejected push does not fail the run"
                .into(),
        );
    }

    report
}
