use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use mlsecops_runner::config::parse_assignment;
use mlsecops_runner::lockfile::generate_lock;
use mlsecops_runner::observability::log_snapshot;
use mlsecops_runner::pipeline::{RunOptions, StageRegistry, StageStatus, prepare_run};
use mlsecops_runner::presets::generate_preset;
use mlsecops_runner::recipe::Recipe;
use mlsecops_runner::security::{compute_sha256, write_sha256};
use mlsecops_runner::stages;
use mlsecops_runner::validation::validate_recipe;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli { log_json, command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(log_json, otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match command {
        Commands::Run(args) => run_recipe(args),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Validate { recipe } => validate_recipe_cmd(recipe),
        Commands::Lock { recipe, output } => lock_recipe(recipe, output),
        Commands::Recipe { action } => recipe_command(action),
        Commands::Security { action } => security_command(action),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "mlsecops-runner",
                &mut io::stdout(),
            );
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(log_json: bool, otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let text_layer =
        (!log_json).then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));
    let json_layer = log_json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
    });

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "mlsecops-runner")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(text_layer)
                .with(json_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

fn run_recipe(args: RunArgs) -> Result<()> {
    let RunArgs {
        recipe: recipe_path,
        dry_run,
        skip,
        set,
        env_file,
        report: report_path,
        print_metrics,
        metrics_json,
        metrics_prometheus,
        otlp_endpoint: _,
    } = args;

    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let options = RunOptions {
        env_file,
        overrides: set,
        skip,
        dry_run,
    };
    let (executor, mut ctx) = prepare_run(&recipe, &registry, &options)?;

    if dry_run {
        info!(
            pipeline = ctx.pipeline.as_str(),
            workdir = %ctx.workdir.display(),
            "Loaded recipe with {} stage(s); dry run, nothing executed",
            executor.stage_names().len()
        );
        for line in executor.plan(&ctx.masker) {
            println!("{line}");
        }
        return Ok(());
    }

    let metrics_handle = executor.metrics();
    let report = executor.execute(&mut ctx);

    for outcome in &report.stages {
        info!(
            stage = outcome.name.as_str(),
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "Stage outcome"
        );
    }

    if let Some(path) = report_path {
        report.write_json(&path)?;
        info!(report = %path.display(), "Run report written");
    }

    if print_metrics || metrics_json.is_some() || metrics_prometheus.is_some() {
        let snapshot = metrics_handle.snapshot();
        if print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = metrics_json {
            create_parent(&path, "metrics")?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = metrics_prometheus {
            create_parent(&path, "metrics")?;
            std::fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    if let Some(stage) = &report.failed_stage {
        bail!("Pipeline '{}' failed at stage '{}'", report.pipeline, stage);
    }

    let tolerated = report
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Tolerated)
        .count();
    info!(
        pipeline = report.pipeline.as_str(),
        duration_ms = report.duration_ms,
        tolerated,
        "Pipeline completed"
    );
    Ok(())
}

fn create_parent(path: &Path, what: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create {what} directory: {}", parent.display())
        })?;
    }
    Ok(())
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_recipe(recipe_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    create_parent(&output_path, "lockfile")?;
    generate_lock(&recipe, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
        RecipeCommands::Diff { lhs, rhs } => diff_recipes(&lhs, &rhs),
    }
}

fn lint_recipes(recipes: &[PathBuf]) -> Result<()> {
    if recipes.is_empty() {
        bail!("No recipe files supplied for linting");
    }

    let registry = build_registry();
    let mut failures = 0usize;

    for recipe_path in recipes {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report = validate_recipe(&recipe, &registry);
                for warning in &report.warnings {
                    warn!(file = %recipe_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %recipe_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }

    info!("All recipe lint checks passed");
    Ok(())
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "<invalid>".into())
}

fn diff_recipes(lhs: &Path, rhs: &Path) -> Result<()> {
    let left = Recipe::load(lhs)?;
    let right = Recipe::load(rhs)?;

    let mut differences = Vec::new();

    if left.version != right.version {
        differences.push(format!(
            "Version mismatch: {} vs {}",
            left.version, right.version
        ));
    }

    if left.pipeline_name() != right.pipeline_name() {
        differences.push(format!(
            "Pipeline name differs: '{}' vs '{}'",
            left.pipeline_name(),
            right.pipeline_name()
        ));
    }

    if left.workdir != right.workdir {
        differences.push(format!(
            "Working directory differs: {:?} vs {:?}",
            left.workdir, right.workdir
        ));
    }

    let left_env = left.env_pairs()?;
    let right_env = right.env_pairs()?;
    if left_env != right_env {
        differences.push(format!(
            "Env differs: {} vs {}",
            to_json(&left_env),
            to_json(&right_env)
        ));
    }

    if left.secrets != right.secrets {
        differences.push(format!(
            "Secrets differ: {:?} vs {:?}",
            left.secrets, right.secrets
        ));
    }

    let min_len = left.stages.len().min(right.stages.len());
    if left.stages.len() != right.stages.len() {
        differences.push(format!(
            "Pipeline stage count differs: {} vs {}",
            left.stages.len(),
            right.stages.len()
        ));
    }

    for (idx, (l_stage, r_stage)) in left
        .stages
        .iter()
        .take(min_len)
        .zip(right.stages.iter())
        .enumerate()
    {
        if l_stage.name != r_stage.name {
            differences.push(format!(
                "Stage {} name differs: '{}' vs '{}'",
                idx + 1,
                l_stage.name,
                r_stage.name
            ));
        }
        if l_stage.stage != r_stage.stage {
            differences.push(format!(
                "Stage {} ('{}') kind differs: '{}' vs '{}'",
                idx + 1,
                l_stage.name,
                l_stage.stage,
                r_stage.stage
            ));
        }
        let l_params = l_stage.params.clone().unwrap_or_default();
        let r_params = r_stage.params.clone().unwrap_or_default();
        if l_params != r_params {
            differences.push(format!(
                "Stage {} ('{}') parameters differ: {} vs {}",
                idx + 1,
                l_stage.name,
                to_json(&l_params),
                to_json(&r_params)
            ));
        }
        if l_stage.continue_on_error != r_stage.continue_on_error {
            differences.push(format!(
                "Stage {} ('{}') continue_on_error differs: {} vs {}",
                idx + 1,
                l_stage.name,
                l_stage.continue_on_error,
                r_stage.continue_on_error
            ));
        }
        if l_stage.skip_if != r_stage.skip_if {
            differences.push(format!(
                "Stage {} ('{}') skip_if differs: {:?} vs {:?}",
                idx + 1,
                l_stage.name,
                l_stage.skip_if,
                r_stage.skip_if
            ));
        }
    }

    for (side, recipe) in [("left", &left), ("right", &right)] {
        for (extra_idx, stage) in recipe.stages[min_len..].iter().enumerate() {
            differences.push(format!(
                "Extra stage in {side} recipe at position {}: '{}' ({})",
                min_len + extra_idx + 1,
                stage.name,
                stage.stage
            ));
        }
    }

    if differences.is_empty() {
        info!(
            left = %lhs.display(),
            right = %rhs.display(),
            "Recipes are equivalent"
        );
        println!("Recipes match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Recipe differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        bail!("Recipes differ ({} difference(s) found)", differences.len());
    }
}

fn security_command(command: SecurityCommands) -> Result<()> {
    match command {
        SecurityCommands::Digest { path, output } => {
            if let Some(out_path) = output {
                let digest = write_sha256(&path, &out_path)?;
                println!("{}  {}", digest, path.display());
                info!(
                    file = %path.display(),
                    digest_output = %out_path.display(),
                    "SHA256 digest written"
                );
            } else {
                let digest = compute_sha256(&path)?;
                println!("{}  {}", digest, path.display());
                info!(file = %path.display(), "SHA256 computed");
            }
            Ok(())
        }
    }
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "mlsecops-runner",
    version,
    about = "Sequential pipeline runner for MLSecOps CI stages"
)]
struct Cli {
    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of a recipe in order.
    Run(RunArgs),
    ListStages,
    Validate {
        recipe: PathBuf,
    },
    Lock {
        recipe: PathBuf,
        output: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    Security {
        #[command(subcommand)]
        action: SecurityCommands,
    },
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct RunArgs {
    recipe: PathBuf,
    /// Build and print the plan without running anything.
    #[arg(long)]
    dry_run: bool,
    /// Skip a stage by name; repeatable.
    #[arg(long, value_name = "STAGE")]
    skip: Vec<String>,
    /// Override an environment variable; repeatable.
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_assignment)]
    set: Vec<(String, String)>,
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
    /// Write the run report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}

#[derive(Subcommand)]
enum SecurityCommands {
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
