use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, instrument, warn};

use crate::config::RunEnvironment;
use crate::observability::MetricsCollector;
use crate::process::ProcessSpec;
use crate::recipe::Recipe;
use crate::security::SecretMasker;

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: stage.into(),
            params: None,
            continue_on_error: false,
            skip_if: None,
        }
    }
}

/// Mutable state threaded through a run.
#[derive(Debug)]
pub struct RunContext {
    pub pipeline: String,
    pub workdir: PathBuf,
    pub env: RunEnvironment,
    pub masker: SecretMasker,
    /// Interpreter selected by a `venv` stage, if one has run.
    pub python: Option<PathBuf>,
    /// Summaries of completed stages keyed by stage name.
    pub state: Map<String, Value>,
}

impl RunContext {
    pub fn new(pipeline: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline: pipeline.into(),
            workdir: workdir.into(),
            env: RunEnvironment::default(),
            masker: SecretMasker::default(),
            python: None,
            state: Map::new(),
        }
    }

    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    /// Process rooted at the workdir with the run environment exported.
    pub fn process(&self, program: impl Into<String>) -> ProcessSpec {
        ProcessSpec::new(program)
            .cwd(&self.workdir)
            .envs(self.env.exported())
    }

    pub fn python_program(&self, explicit: Option<&str>) -> String {
        if let Some(python) = explicit {
            return python.to_string();
        }
        if let Some(python) = &self.python {
            return python.to_string_lossy().to_string();
        }
        default_python().to_string()
    }

    pub fn summary(&self, stage: &str) -> Option<&Value> {
        self.state.get(stage)
    }
}

pub fn default_python() -> &'static str {
    if cfg!(windows) { "python" } else { "python3" }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> &'static str;

    /// One-line plan shown by dry runs.
    fn describe(&self) -> String {
        self.kind().to_string()
    }

    /// Run the stage; the returned value becomes the stage summary.
    fn run(&self, ctx: &mut RunContext) -> Result<Value>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Tolerated,
    Skipped,
    NotRun,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Tolerated => "tolerated",
            StageStatus::Skipped => "skipped",
            StageStatus::NotRun => "not_run",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: String,
    pub kind: String,
    pub status: StageStatus,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub summary: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    pub stages: Vec<StageOutcome>,
}

impl PipelineReport {
    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn statuses(&self) -> Vec<(&str, StageStatus)> {
        self.stages
            .iter()
            .map(|s| (s.name.as_str(), s.status))
            .collect()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
        Ok(())
    }
}

struct PlannedStage {
    spec: StageSpec,
    stage: Box<dyn Stage>,
}

pub struct PipelineExecutor {
    stages: Vec<PlannedStage>,
    skip: HashSet<String>,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.spec.name.as_str()).collect()
    }

    /// One line per stage, with secret values replaced by the masker.
    pub fn plan(&self, masker: &SecretMasker) -> Vec<String> {
        self.stages
            .iter()
            .enumerate()
            .map(|(idx, planned)| {
                let mut line = format!(
                    "{}. {} [{}] {}",
                    idx + 1,
                    planned.spec.name,
                    planned.spec.stage,
                    planned.stage.describe()
                );
                if planned.spec.continue_on_error {
                    line.push_str(" (continue on error)");
                }
                if self.skip.contains(&planned.spec.name) {
                    line.push_str(" (skipped)");
                } else if let Some(flag) = &planned.spec.skip_if {
                    line.push_str(&format!(" (skip if {flag})"));
                }
                masker.mask(&line)
            })
            .collect()
    }

    fn should_skip(&self, spec: &StageSpec, ctx: &RunContext) -> Option<String> {
        if self.skip.contains(&spec.name) {
            return Some("requested on command line".to_string());
        }
        match &spec.skip_if {
            Some(flag) if ctx.env.flag(flag) => Some(format!("{flag} is set")),
            _ => None,
        }
    }

    /// Run every stage in order. Only a failing stage without
    /// `continue_on_error` stops the run; later stages are reported `not_run`.
    #[instrument(skip(self, ctx), fields(pipeline = %ctx.pipeline))]
    pub fn execute(&self, ctx: &mut RunContext) -> PipelineReport {
        self.metrics.reset();
        let started_at = Utc::now();
        let total_start = Instant::now();
        let mut outcomes = Vec::with_capacity(self.stages.len());
        let mut failed_stage: Option<String> = None;

        for planned in &self.stages {
            let spec = &planned.spec;
            let mut outcome = StageOutcome {
                name: spec.name.clone(),
                kind: spec.stage.clone(),
                status: StageStatus::NotRun,
                duration_ms: 0.0,
                error: None,
                summary: Value::Null,
            };

            if failed_stage.is_some() {
                outcomes.push(outcome);
                continue;
            }

            if let Some(reason) = self.should_skip(spec, ctx) {
                info!(stage = spec.name.as_str(), %reason, "Stage skipped");
                outcome.status = StageStatus::Skipped;
                self.metrics.record_status(outcome.status);
                outcomes.push(outcome);
                continue;
            }

            let span = tracing::span!(
                tracing::Level::INFO,
                "stage",
                stage = spec.name.as_str(),
                kind = spec.stage.as_str()
            );
            let _span_guard = span.enter();
            info!("Stage started");
            let timer = self.metrics.start_stage(&spec.name);
            let result = planned.stage.run(ctx);
            outcome.duration_ms = timer.elapsed().as_secs_f64() * 1_000.0;
            drop(timer);

            match result {
                Ok(summary) => {
                    ctx.state.insert(spec.name.clone(), summary.clone());
                    outcome.status = StageStatus::Succeeded;
                    outcome.summary = summary;
                    info!(duration_ms = outcome.duration_ms, "Stage succeeded");
                }
                Err(err) => {
                    let message = ctx.masker.mask(&format!("{err:#}"));
                    ctx.state.insert(
                        spec.name.clone(),
                        json!({"status": "failed", "error": message.clone()}),
                    );
                    if spec.continue_on_error {
                        warn!(error = %message, "Stage failed; continuing because failure is tolerated");
                        outcome.status = StageStatus::Tolerated;
                    } else {
                        error!(error = %message, "Stage failed; aborting remaining stages");
                        outcome.status = StageStatus::Failed;
                        failed_stage = Some(spec.name.clone());
                    }
                    outcome.error = Some(message);
                }
            }
            self.metrics.record_status(outcome.status);
            outcomes.push(outcome);
        }

        let duration = total_start.elapsed();
        self.metrics.record_total_duration(duration);

        PipelineReport {
            pipeline: ctx.pipeline.clone(),
            started_at,
            duration_ms: duration.as_secs_f64() * 1_000.0,
            succeeded: failed_stage.is_none(),
            failed_stage,
            stages: outcomes,
        }
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }
}

/// Instantiate every stage of `specs`, interpolating parameters against `env`.
pub fn build_pipeline(
    stage_registry: &StageRegistry,
    stage_specs: &[StageSpec],
    env: &RunEnvironment,
    skip: &[String],
) -> Result<PipelineExecutor> {
    let mut stages = Vec::with_capacity(stage_specs.len());
    let mut seen = HashSet::new();
    for spec in stage_specs {
        if !seen.insert(spec.name.as_str()) {
            bail!("Duplicate stage name '{}'", spec.name);
        }
        let mut params = Value::Object(spec.params.clone().unwrap_or_default());
        env.interpolate_value(&mut params)
            .with_context(|| format!("Stage '{}' parameters", spec.name))?;
        let params = match params {
            Value::Object(map) => map,
            _ => StageParameters::new(),
        };
        let stage = stage_registry
            .create(&spec.stage, params)
            .with_context(|| format!("Failed to configure stage '{}'", spec.name))?;
        stages.push(PlannedStage {
            spec: spec.clone(),
            stage,
        });
    }

    for name in skip {
        if !seen.contains(name.as_str()) {
            bail!("Cannot skip unknown stage '{name}'");
        }
    }

    Ok(PipelineExecutor {
        stages,
        skip: skip.iter().cloned().collect(),
        metrics: MetricsCollector::new(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub env_file: Option<PathBuf>,
    pub overrides: Vec<(String, String)>,
    pub skip: Vec<String>,
    /// Plan only: missing secrets are reported instead of failing.
    pub dry_run: bool,
}

/// Resolve the run environment and secrets for `recipe` and build its executor.
pub fn prepare_run(
    recipe: &Recipe,
    registry: &StageRegistry,
    options: &RunOptions,
) -> Result<(PipelineExecutor, RunContext)> {
    let mut workdir = recipe.resolve_workdir();
    fs::create_dir_all(&workdir)
        .with_context(|| format!("Failed to create working directory: {}", workdir.display()))?;
    if let Ok(canonical) = workdir.canonicalize() {
        workdir = canonical;
    }

    let default_env_file = workdir.join(".env");
    let env_file = match &options.env_file {
        Some(path) => Some(path.clone()),
        None if default_env_file.is_file() => Some(default_env_file),
        None => None,
    };

    let env = RunEnvironment::resolve(&recipe.env_pairs()?, env_file.as_deref(), &options.overrides)?;

    let mut secret_values = Vec::with_capacity(recipe.secrets.len());
    for name in &recipe.secrets {
        match env.lookup(name) {
            Some(value) if !value.is_empty() => secret_values.push(value),
            _ if options.dry_run => warn!(secret = name.as_str(), "Required secret is not set"),
            _ => bail!("Required secret '{name}' is not set"),
        }
    }

    let executor = build_pipeline(registry, &recipe.stages, &env, &options.skip)?;

    let mut ctx = RunContext::new(recipe.pipeline_name(), workdir);
    ctx.env = env;
    ctx.masker = SecretMasker::new(secret_values);
    Ok((executor, ctx))
}
