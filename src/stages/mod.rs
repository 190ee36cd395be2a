use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::info;

use crate::pipeline::{RunContext, Stage, StageParameters, StageRegistry, default_python};
use crate::process::{ProcessOutput, ProcessSpec, run_checked, shell_spec};
use crate::security::fingerprint;

pub mod assurance;
pub mod publish;

pub const REQUIREMENTS_MARKER: &str = ".mlsecops-requirements.sha256";

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("command", |params| {
        Ok(Box::new(CommandStage::from_params(params)?))
    });
    registry.register("python", |params| {
        Ok(Box::new(PythonStage::from_params(params)?))
    });
    registry.register("venv", |params| {
        Ok(Box::new(VenvStage::from_params(params)?))
    });
    assurance::register(registry);
    publish::register(registry);
}

struct CommandStage {
    invocation: Invocation,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    log: Option<PathBuf>,
}

enum Invocation {
    Program(String),
    Shell(String),
}

impl CommandStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let program = take_string(&mut params, "program");
        let shell = take_string(&mut params, "shell");
        let invocation = match (program, shell) {
            (Some(program), None) => Invocation::Program(program),
            (None, Some(script)) => Invocation::Shell(script),
            (Some(_), Some(_)) => {
                bail!("command stage accepts either 'program' or 'shell', not both")
            }
            (None, None) => bail!("command stage requires a 'program' or 'shell' parameter"),
        };
        let args = take_string_list(&mut params, "args")?;
        if matches!(invocation, Invocation::Shell(_)) && !args.is_empty() {
            bail!("command stage 'args' cannot be combined with 'shell'");
        }
        let stage = Self {
            invocation,
            args,
            cwd: take_string(&mut params, "cwd").map(PathBuf::from),
            env: take_string_map(&mut params, "env")?,
            log: take_string(&mut params, "log").map(PathBuf::from),
        };
        ensure_consumed("command", &params)?;
        Ok(stage)
    }
}

impl Stage for CommandStage {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn describe(&self) -> String {
        match &self.invocation {
            Invocation::Program(program) => ProcessSpec::new(program.clone())
                .args(self.args.iter().cloned())
                .display(),
            Invocation::Shell(script) => script.clone(),
        }
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let base = match &self.invocation {
            Invocation::Program(program) => ctx.process(program.clone()).args(self.args.iter().cloned()),
            Invocation::Shell(script) => {
                let shell = shell_spec(script);
                ctx.process(shell.program).args(shell.args)
            }
        };
        let spec = finish_spec(base, ctx, self.cwd.as_deref(), &self.env, self.log.as_deref());
        let output = run_checked(&spec, &ctx.masker)?;
        Ok(process_summary(&output))
    }
}

struct PythonStage {
    target: PythonTarget,
    args: Vec<String>,
    python: Option<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    log: Option<PathBuf>,
    metrics_file: Option<PathBuf>,
}

enum PythonTarget {
    Script(String),
    Module(String),
}

impl PythonStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let target = match (
            take_string(&mut params, "script"),
            take_string(&mut params, "module"),
        ) {
            (Some(script), None) => PythonTarget::Script(script),
            (None, Some(module)) => PythonTarget::Module(module),
            (Some(_), Some(_)) => bail!("python stage accepts either 'script' or 'module'"),
            (None, None) => bail!("python stage requires a 'script' or 'module' parameter"),
        };
        let stage = Self {
            target,
            args: take_string_list(&mut params, "args")?,
            python: take_string(&mut params, "python"),
            cwd: take_string(&mut params, "cwd").map(PathBuf::from),
            env: take_string_map(&mut params, "env")?,
            log: take_string(&mut params, "log").map(PathBuf::from),
            metrics_file: take_string(&mut params, "metrics_file").map(PathBuf::from),
        };
        ensure_consumed("python", &params)?;
        Ok(stage)
    }

    fn target_args(&self) -> Vec<String> {
        let mut args = match &self.target {
            PythonTarget::Script(script) => vec![script.clone()],
            PythonTarget::Module(module) => vec!["-m".to_string(), module.clone()],
        };
        args.extend(self.args.iter().cloned());
        args
    }
}

impl Stage for PythonStage {
    fn kind(&self) -> &'static str {
        "python"
    }

    fn describe(&self) -> String {
        ProcessSpec::new(self.python.clone().unwrap_or_else(|| "python".into()))
            .args(self.target_args())
            .display()
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let python = ctx.python_program(self.python.as_deref());
        let base = ctx.process(python).args(self.target_args());
        let spec = finish_spec(base, ctx, self.cwd.as_deref(), &self.env, self.log.as_deref());
        let output = run_checked(&spec, &ctx.masker)?;
        let mut summary = process_summary(&output);

        if let Some(metrics_file) = &self.metrics_file {
            let path = ctx.resolve_path(metrics_file);
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Metrics file was not produced: {}", path.display()))?;
            let metrics: Value = serde_json::from_str(&content)
                .with_context(|| format!("Metrics file is not valid JSON: {}", path.display()))?;
            summary["metrics"] = metrics;
            summary["metrics_file"] = json!(path.to_string_lossy());
        }
        Ok(summary)
    }
}

/// Creates a virtual environment and installs declared dependencies once;
/// later runs with unchanged requirements skip the install.
struct VenvStage {
    path: PathBuf,
    requirements: Vec<PathBuf>,
    requirements_explicit: bool,
    packages: Vec<String>,
    python: Option<String>,
    upgrade_pip: bool,
    pip_args: Vec<String>,
}

impl VenvStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let requirements = take_string_list(&mut params, "requirements")?;
        let requirements_explicit = !requirements.is_empty();
        let requirements = if requirements_explicit {
            requirements.into_iter().map(PathBuf::from).collect()
        } else {
            vec![PathBuf::from("requirements.txt")]
        };
        let stage = Self {
            path: take_string(&mut params, "path")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".venv")),
            requirements,
            requirements_explicit,
            packages: take_string_list(&mut params, "packages")?,
            python: take_string(&mut params, "python"),
            upgrade_pip: take_bool(&mut params, "upgrade_pip")?.unwrap_or(false),
            pip_args: take_string_list(&mut params, "pip_args")?,
        };
        ensure_consumed("venv", &params)?;
        Ok(stage)
    }

    fn pip(&self, ctx: &RunContext, python: &Path) -> ProcessSpec {
        ctx.process(python.to_string_lossy().to_string())
            .args(["-m", "pip", "install"])
            .args(self.pip_args.iter().cloned())
    }
}

impl Stage for VenvStage {
    fn kind(&self) -> &'static str {
        "venv"
    }

    fn describe(&self) -> String {
        format!(
            "create {} and install {}",
            self.path.display(),
            self.requirements
                .iter()
                .map(|p| p.display().to_string())
                .chain(self.packages.iter().cloned())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let venv_dir = ctx.resolve_path(&self.path);
        let created = !venv_dir.join("pyvenv.cfg").is_file();
        if created {
            let bootstrap = self.python.clone().unwrap_or_else(|| default_python().to_string());
            let spec = ctx
                .process(bootstrap)
                .args(["-m", "venv"])
                .arg(venv_dir.to_string_lossy().to_string());
            run_checked(&spec, &ctx.masker)?;
            info!(venv = %venv_dir.display(), "Virtual environment created");
        }

        let python = venv_python(&venv_dir);
        if !python.exists() {
            bail!(
                "Virtual environment at {} has no interpreter at {}",
                venv_dir.display(),
                python.display()
            );
        }

        let mut requirement_files = Vec::new();
        for requirement in &self.requirements {
            let path = ctx.resolve_path(requirement);
            if path.is_file() {
                requirement_files.push(path);
            } else if self.requirements_explicit {
                bail!("Requirements file not found: {}", path.display());
            }
        }

        let mut extra = self.packages.clone();
        extra.extend(self.pip_args.iter().cloned());
        if self.upgrade_pip {
            extra.push("--upgrade-pip".to_string());
        }
        let file_refs: Vec<&Path> = requirement_files.iter().map(PathBuf::as_path).collect();
        let digest = fingerprint(&file_refs, &extra)?;

        let marker = venv_dir.join(REQUIREMENTS_MARKER);
        let up_to_date = fs::read_to_string(&marker)
            .map(|existing| existing.trim() == digest)
            .unwrap_or(false);

        if up_to_date {
            info!(venv = %venv_dir.display(), "Dependencies already installed; skipping");
        } else {
            if self.upgrade_pip {
                let spec = ctx
                    .process(python.to_string_lossy().to_string())
                    .args(["-m", "pip", "install", "--upgrade", "pip"]);
                run_checked(&spec, &ctx.masker)?;
            }
            for file in &requirement_files {
                let spec = self
                    .pip(ctx, &python)
                    .arg("-r")
                    .arg(file.to_string_lossy().to_string());
                run_checked(&spec, &ctx.masker)?;
            }
            if !self.packages.is_empty() {
                let spec = self.pip(ctx, &python).args(self.packages.iter().cloned());
                run_checked(&spec, &ctx.masker)?;
            }
            fs::write(&marker, format!("{digest}\n"))
                .with_context(|| format!("Failed to write install marker: {}", marker.display()))?;
            info!(venv = %venv_dir.display(), "Dependencies installed");
        }

        activate(ctx, &venv_dir, &python)?;

        Ok(json!({
            "venv": venv_dir.to_string_lossy(),
            "python": python.to_string_lossy(),
            "created": created,
            "installed": !up_to_date,
            "requirements_hash": digest,
        }))
    }
}

fn venv_python(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts").join("python.exe")
    } else {
        venv_dir.join("bin").join("python")
    }
}

/// Point later stages at the venv: interpreter, `VIRTUAL_ENV`, and `PATH`.
fn activate(ctx: &mut RunContext, venv_dir: &Path, python: &Path) -> Result<()> {
    ctx.python = Some(python.to_path_buf());
    ctx.env
        .set("VIRTUAL_ENV", venv_dir.to_string_lossy().to_string());
    if let Some(bin_dir) = python.parent() {
        let current = ctx.env.lookup("PATH").unwrap_or_default();
        let mut paths = vec![bin_dir.to_path_buf()];
        paths.extend(std::env::split_paths(&current));
        let joined = std::env::join_paths(paths).context("Failed to extend PATH with venv")?;
        ctx.env.set("PATH", joined.to_string_lossy().to_string());
    }
    Ok(())
}

fn finish_spec(
    mut spec: ProcessSpec,
    ctx: &RunContext,
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
    log: Option<&Path>,
) -> ProcessSpec {
    if let Some(dir) = cwd {
        spec.cwd = Some(ctx.resolve_path(dir));
    }
    spec = spec.envs(env);
    spec.log_file(log.map(|path| ctx.resolve_path(path)))
}

pub(crate) fn process_summary(output: &ProcessOutput) -> Value {
    json!({
        "command": output.command,
        "exit_code": output.exit_code,
        "duration_ms": output.duration.as_secs_f64() * 1_000.0,
    })
}

pub(crate) fn ensure_consumed(stage: &str, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut unknown: Vec<_> = params.keys().cloned().collect();
    unknown.sort();
    Err(anyhow!(
        "Unknown parameter(s) for {} stage: {}",
        stage,
        unknown.join(", ")
    ))
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

pub(crate) fn take_u32(params: &mut StageParameters, key: &str) -> Result<Option<u32>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => num
            .as_u64()
            .and_then(|n| n.try_into().ok())
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("'{key}' must be a non-negative integer, got '{s}'")),
        Some(other) => bail!("'{key}' must be a non-negative integer, got {other}"),
    }
}

pub(crate) fn take_f64(params: &mut StageParameters, key: &str) -> Result<Option<f64>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => Ok(num.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("'{key}' must be a number, got '{s}'")),
        Some(other) => bail!("'{key}' must be a number, got {other}"),
    }
}

pub(crate) fn take_bool(params: &mut StageParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" | "" => Ok(Some(false)),
            _ => bail!("'{key}' must be a boolean, got '{s}'"),
        },
        Some(other) => bail!("'{key}' must be a boolean, got {other}"),
    }
}

/// A list parameter; a bare string is accepted as a one-element list.
pub(crate) fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Vec<String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(anyhow!("'{key}' entries must be scalars, got {other}")),
            })
            .collect(),
        Some(other) => bail!("'{key}' must be a list of strings, got {other}"),
    }
}

pub(crate) fn take_string_map(
    params: &mut StageParameters,
    key: &str,
) -> Result<BTreeMap<String, String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                Value::Number(_) | Value::Bool(_) => Ok((k, v.to_string())),
                other => Err(anyhow!("'{key}.{k}' must be a scalar, got {other}")),
            })
            .collect(),
        Some(other) => bail!("'{key}' must be a mapping, got {other}"),
    }
}
