//! Built-in assurance stages: probe scans, dataset audits, fairness metrics,
//! SBOM generation, and the governance report that stitches them together.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::{
    ensure_consumed, take_f64, take_string, take_string_list, take_string_map, take_u32,
};
use crate::audit::{
    RiskLevel, assemble_security_report, build_manifest, evaluate_membership_inference,
    scan_for_data_poisoning, write_security_report,
};
use crate::dataset::Table;
use crate::fairness::{
    self, FairnessReport, binarize, evaluate_feature, overall_metrics, write_group_csv,
};
use crate::pipeline::{RunContext, Stage, StageParameters, StageRegistry};
use crate::process::{ProcessError, run_checked};

pub const GARAK_SUMMARY_FILE: &str = "garak_run_summary.json";
pub const SBOM_SUMMARY_FILE: &str = "sbom_summary.json";
pub const SBOM_FREEZE_FILE: &str = "sbom_requirements_freeze.txt";
pub const GOVERNANCE_JSON_FILE: &str = "model_governance_report.json";
pub const GOVERNANCE_MD_FILE: &str = "model_governance_report.md";

const DEFAULT_MODEL_NAME: &str = "sshleifer/tiny-gpt2";
const DEFAULT_PROBES: &str = "promptinject.HijackNevermind,dan.Dan_8_0";
const DEFAULT_GENERATIONS: u32 = 2;

pub fn register(registry: &mut StageRegistry) {
    registry.register("garak", |params| Ok(Box::new(GarakStage::from_params(params)?)));
    registry.register("data-audit", |params| {
        Ok(Box::new(DataAuditStage::from_params(params)?))
    });
    registry.register("fairness", |params| {
        Ok(Box::new(FairnessStage::from_params(params)?))
    });
    registry.register("sbom", |params| Ok(Box::new(SbomStage::from_params(params)?)));
    registry.register("governance", |params| {
        Ok(Box::new(GovernanceStage::from_params(params)?))
    });
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

struct GarakStage {
    model_type: String,
    model_name: String,
    probes: String,
    generations: u32,
    python: Option<String>,
    scan_dir: Option<PathBuf>,
    output_dir: PathBuf,
    log: Option<PathBuf>,
}

impl GarakStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let probes = take_string_list(&mut params, "probes")?;
        let stage = Self {
            model_type: take_string(&mut params, "model_type")
                .unwrap_or_else(|| "huggingface".to_string()),
            model_name: take_string(&mut params, "model_name")
                .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            probes: if probes.is_empty() {
                DEFAULT_PROBES.to_string()
            } else {
                probes.join(",")
            },
            generations: take_u32(&mut params, "generations")?.unwrap_or(DEFAULT_GENERATIONS),
            python: take_string(&mut params, "python"),
            scan_dir: take_string(&mut params, "scan_dir").map(PathBuf::from),
            output_dir: take_string(&mut params, "output_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("artifacts/mlsecops")),
            log: take_string(&mut params, "log").map(PathBuf::from),
        };
        if stage.generations == 0 {
            bail!("garak 'generations' must be at least 1");
        }
        ensure_consumed("garak", &params)?;
        Ok(stage)
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-m".into(),
            "garak".into(),
            "--model_type".into(),
            self.model_type.clone(),
            "--model_name".into(),
            self.model_name.clone(),
            "--probes".into(),
            self.probes.clone(),
            "--generations".into(),
            self.generations.to_string(),
        ]
    }
}

fn garak_reports(dir: &Path) -> Result<Vec<PathBuf>> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = Path::new(&escaped).join("garak.*.jsonl");
    let pattern = pattern.to_string_lossy();
    let mut reports = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("Invalid glob: {pattern}"))? {
        reports.push(entry?);
    }
    Ok(reports)
}

const GARAK_SITE_ROOT: &str =
    "import garak, pathlib; print(pathlib.Path(garak.__file__).resolve().parent.parent)";

/// Directory holding the installed `garak` package, so its probe and plugin
/// resources resolve relative to the scan's working directory.
fn garak_site_root(ctx: &RunContext, python: &str) -> Option<PathBuf> {
    let spec = ctx.process(python).args(["-c", GARAK_SITE_ROOT]);
    let located = match run_checked(&spec, &ctx.masker) {
        Ok(output) => output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(PathBuf::from),
        Err(err) => {
            warn!(error = %err, "Could not locate the garak installation");
            return None;
        }
    };
    match located {
        Some(dir) if dir.is_dir() => Some(dir),
        other => {
            warn!(reported = ?other, "garak site root is not a directory");
            None
        }
    }
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

impl Stage for GarakStage {
    fn kind(&self) -> &'static str {
        "garak"
    }

    fn describe(&self) -> String {
        format!(
            "garak scan of {} ({}) with probes {} x{}",
            self.model_name, self.model_type, self.probes, self.generations
        )
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let python = ctx.python_program(self.python.as_deref());
        let scan_dir = match &self.scan_dir {
            Some(dir) => ctx.resolve_path(dir),
            None => garak_site_root(ctx, &python).unwrap_or_else(|| {
                info!(workdir = %ctx.workdir.display(), "Scanning from the working directory");
                ctx.workdir.clone()
            }),
        };
        let output_dir = ctx.resolve_path(&self.output_dir);
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        let existing: HashSet<PathBuf> = garak_reports(&scan_dir)?.into_iter().collect();

        let spec = ctx
            .process(python)
            .args(self.args())
            .cwd(&scan_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .log_file(self.log.as_ref().map(|p| ctx.resolve_path(p)));
        run_checked(&spec, &ctx.masker)?;

        let mut summary = Map::new();
        summary.insert("model_name".into(), json!(self.model_name));
        summary.insert("probes".into(), json!(self.probes));
        summary.insert("generations".into(), json!(self.generations.to_string()));
        summary.insert("scan_dir".into(), json!(path_string(&scan_dir)));

        let newest = garak_reports(&scan_dir)?
            .into_iter()
            .filter(|report| !existing.contains(report))
            .max_by_key(|report| modified(report));
        match newest {
            Some(report) => {
                let file_name = report
                    .file_name()
                    .ok_or_else(|| anyhow!("Report path has no file name: {}", report.display()))?;
                let target = output_dir.join(file_name);
                fs::copy(&report, &target).with_context(|| {
                    format!("Failed to copy garak report to {}", target.display())
                })?;
                summary.insert("report_file".into(), json!(path_string(&target)));
            }
            None => warn!(dir = %scan_dir.display(), "garak produced no new report file"),
        }

        let log_path = scan_dir.join("garak.log");
        if log_path.is_file() {
            let target = output_dir.join("garak.log");
            fs::copy(&log_path, &target)
                .with_context(|| format!("Failed to copy garak log to {}", target.display()))?;
            summary.insert("log_file".into(), json!(path_string(&target)));
        }

        let summary = Value::Object(summary);
        write_json(&output_dir.join(GARAK_SUMMARY_FILE), &summary)?;
        info!(output = %output_dir.display(), "garak scan artifacts collected");
        Ok(summary)
    }
}

struct Confidences {
    train: PathBuf,
    test: PathBuf,
    column: String,
}

struct DataAuditStage {
    train: PathBuf,
    test: PathBuf,
    label: String,
    numeric: Vec<String>,
    categorical: Vec<String>,
    confidences: Option<Confidences>,
    output_dir: PathBuf,
    fail_on: Option<RiskLevel>,
}

impl DataAuditStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let train = take_string(&mut params, "train")
            .ok_or_else(|| anyhow!("data-audit stage requires a 'train' CSV path"))?;
        let test = take_string(&mut params, "test")
            .ok_or_else(|| anyhow!("data-audit stage requires a 'test' CSV path"))?;
        let label = take_string(&mut params, "label")
            .ok_or_else(|| anyhow!("data-audit stage requires a 'label' column"))?;

        let confidences = if params.contains_key("confidences") {
            let mut map = take_string_map(&mut params, "confidences")?;
            let train = map
                .remove("train")
                .ok_or_else(|| anyhow!("'confidences.train' is required"))?;
            let test = map
                .remove("test")
                .ok_or_else(|| anyhow!("'confidences.test' is required"))?;
            let column = map.remove("column").unwrap_or_else(|| "confidence".to_string());
            if let Some(extra) = map.keys().next() {
                bail!("Unknown parameter 'confidences.{extra}' for data-audit stage");
            }
            Some(Confidences {
                train: PathBuf::from(train),
                test: PathBuf::from(test),
                column,
            })
        } else {
            None
        };

        let fail_on = match take_string(&mut params, "fail_on") {
            None => None,
            Some(raw) => Some(
                RiskLevel::parse(&raw)
                    .ok_or_else(|| anyhow!("'fail_on' must be low, medium or high, got '{raw}'"))?,
            ),
        };

        let stage = Self {
            train: PathBuf::from(train),
            test: PathBuf::from(test),
            label,
            numeric: take_string_list(&mut params, "numeric")?,
            categorical: take_string_list(&mut params, "categorical")?,
            confidences,
            output_dir: take_string(&mut params, "output_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("artifacts/mlsecops")),
            fail_on,
        };
        ensure_consumed("data-audit", &params)?;
        Ok(stage)
    }
}

fn confidence_column(path: &Path, column: &str) -> Result<Vec<f64>> {
    Table::from_csv_path(path)?
        .numeric_column(column)
        .with_context(|| format!("Invalid confidence file: {}", path.display()))
}

impl Stage for DataAuditStage {
    fn kind(&self) -> &'static str {
        "data-audit"
    }

    fn describe(&self) -> String {
        format!(
            "audit {} / {} (label '{}')",
            self.train.display(),
            self.test.display(),
            self.label
        )
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let train = Table::from_csv_path(&ctx.resolve_path(&self.train))?;
        let test = Table::from_csv_path(&ctx.resolve_path(&self.test))?;

        let manifest = build_manifest(&train, &test, &self.numeric, &self.categorical)?;
        let mut risks = vec![scan_for_data_poisoning(&train, &self.label, &self.numeric)?];
        if let Some(conf) = &self.confidences {
            let train_conf = confidence_column(&ctx.resolve_path(&conf.train), &conf.column)?;
            let test_conf = confidence_column(&ctx.resolve_path(&conf.test), &conf.column)?;
            risks.push(evaluate_membership_inference(&train_conf, &test_conf)?);
        }

        let report = assemble_security_report(manifest, risks);
        let output_dir = ctx.resolve_path(&self.output_dir);
        let report_path = write_security_report(&report, &output_dir)?;
        info!(
            report = %report_path.display(),
            aggregate = %report.aggregate_risk_level,
            "Security report written"
        );

        if let Some(threshold) = self.fail_on
            && report.aggregate_risk_level >= threshold
        {
            bail!(
                "Aggregate risk level '{}' reaches fail_on threshold '{}' (see {})",
                report.aggregate_risk_level,
                threshold,
                report_path.display()
            );
        }

        Ok(json!({
            "status": "completed",
            "report_file": path_string(&report_path),
            "artifact_dir": path_string(&output_dir),
            "aggregate_risk_level": report.aggregate_risk_level,
            "risks": report
                .risks
                .iter()
                .map(|r| json!({"name": r.name, "level": r.level}))
                .collect::<Vec<_>>(),
        }))
    }
}

struct FairnessStage {
    predictions: PathBuf,
    label: String,
    prediction: String,
    sensitive_features: Vec<String>,
    positive_label: Option<String>,
    output_dir: PathBuf,
    max_demographic_parity_difference: Option<f64>,
}

impl FairnessStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let predictions = take_string(&mut params, "predictions")
            .ok_or_else(|| anyhow!("fairness stage requires a 'predictions' CSV path"))?;
        let sensitive_features = take_string_list(&mut params, "sensitive_features")?;
        let stage = Self {
            predictions: PathBuf::from(predictions),
            label: take_string(&mut params, "label").unwrap_or_else(|| "label".to_string()),
            prediction: take_string(&mut params, "prediction")
                .unwrap_or_else(|| "prediction".to_string()),
            sensitive_features: if sensitive_features.is_empty() {
                vec!["region".to_string(), "customer_segment".to_string()]
            } else {
                sensitive_features
            },
            positive_label: take_string(&mut params, "positive_label"),
            output_dir: take_string(&mut params, "output_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("artifacts/assurance/fairlearn")),
            max_demographic_parity_difference: take_f64(
                &mut params,
                "max_demographic_parity_difference",
            )?,
        };
        ensure_consumed("fairness", &params)?;
        Ok(stage)
    }
}

impl Stage for FairnessStage {
    fn kind(&self) -> &'static str {
        "fairness"
    }

    fn describe(&self) -> String {
        format!(
            "fairness of {} across {}",
            self.predictions.display(),
            self.sensitive_features.join(", ")
        )
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let table = Table::from_csv_path(&ctx.resolve_path(&self.predictions))?;
        let labels = table.column(&self.label)?;
        let predictions = table.column(&self.prediction)?;

        let positive = self
            .positive_label
            .clone()
            .unwrap_or_else(|| fairness::positive_label(&labels));
        let y_true = binarize(&labels, &positive);
        let y_pred = binarize(&predictions, &positive);

        let output_dir = ctx.resolve_path(&self.output_dir);
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        let mut report = FairnessReport {
            status: "completed".to_string(),
            positive_label: positive,
            overall: overall_metrics(&y_true, &y_pred),
            features: Default::default(),
            artifact_dir: path_string(&output_dir),
        };

        for feature in &self.sensitive_features {
            if !table.has_column(feature) {
                warn!(feature = feature.as_str(), "Sensitive feature missing; skipping");
                continue;
            }
            let groups = table.column(feature)?;
            let mut evaluated = evaluate_feature(&y_true, &y_pred, &groups)?;
            let csv_path = output_dir.join(format!("{feature}_fairness_groups.csv"));
            write_group_csv(&csv_path, feature, &evaluated.by_group)?;
            evaluated.by_group_csv = Some(path_string(&csv_path));
            report.features.insert(feature.clone(), evaluated);
        }

        let report_path = output_dir.join(fairness::REPORT_FILE);
        write_json(&report_path, &report)?;
        info!(report = %report_path.display(), "Fairness report written");

        if let Some(limit) = self.max_demographic_parity_difference
            && let Some((feature, worst)) = report.worst_demographic_parity()
            && worst > limit
        {
            bail!(
                "Demographic parity difference {worst:.4} for '{feature}' exceeds limit {limit}"
            );
        }

        let mut summary = serde_json::to_value(&report)?;
        summary["report_file"] = json!(path_string(&report_path));
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy)]
enum SbomFormat {
    Json,
    Xml,
}

impl SbomFormat {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            other => bail!("Unsupported SBOM format '{other}'. Use json or xml"),
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }
}

struct SbomStage {
    format: SbomFormat,
    output_dir: PathBuf,
    python: Option<String>,
}

impl SbomStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let format = match take_string(&mut params, "format") {
            Some(raw) => SbomFormat::parse(&raw)?,
            None => SbomFormat::Json,
        };
        let stage = Self {
            format,
            output_dir: take_string(&mut params, "output_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("artifacts/assurance/sbom")),
            python: take_string(&mut params, "python"),
        };
        ensure_consumed("sbom", &params)?;
        Ok(stage)
    }
}

fn cyclonedx_missing(err: &ProcessError) -> bool {
    err.is_not_found()
        || err
            .stderr()
            .is_some_and(|stderr| stderr.contains("No module named"))
}

impl Stage for SbomStage {
    fn kind(&self) -> &'static str {
        "sbom"
    }

    fn describe(&self) -> String {
        format!(
            "CycloneDX SBOM ({}) into {}",
            self.format.extension(),
            self.output_dir.display()
        )
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let output_dir = ctx.resolve_path(&self.output_dir);
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;
        let sbom_path = output_dir.join(format!("sbom.{}", self.format.extension()));
        let python = ctx.python_program(self.python.as_deref());

        let spec = ctx
            .process(python.clone())
            .args(["-m", "cyclonedx_py", "environment", "--of"])
            .arg(self.format.extension().to_ascii_uppercase())
            .arg("-o")
            .arg(path_string(&sbom_path));

        let (summary, failure) = match run_checked(&spec, &ctx.masker) {
            Ok(output) => (
                json!({
                    "status": "completed",
                    "sbom_file": path_string(&sbom_path),
                    "command": output.command,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                }),
                None,
            ),
            Err(err) if cyclonedx_missing(&err) => {
                warn!(error = %err, "CycloneDX unavailable; falling back to pip freeze");
                let freeze = ctx.process(python).args(["-m", "pip", "freeze"]);
                match run_checked(&freeze, &ctx.masker) {
                    Ok(output) => {
                        let fallback = output_dir.join(SBOM_FREEZE_FILE);
                        fs::write(&fallback, &output.stdout).with_context(|| {
                            format!("Failed to write freeze fallback: {}", fallback.display())
                        })?;
                        (
                            json!({
                                "status": "cyclonedx_missing",
                                "fallback_freeze": path_string(&fallback),
                                "note": "CycloneDX is not installed. Run `pip install cyclonedx-bom` for a full SBOM.",
                            }),
                            None,
                        )
                    }
                    Err(freeze_err) => {
                        let summary = json!({
                            "status": "error",
                            "reason": format!("pip freeze fallback failed: {freeze_err}"),
                            "stderr": freeze_err.stderr().unwrap_or_default(),
                        });
                        (summary, Some(anyhow!(freeze_err).context("pip freeze fallback failed")))
                    }
                }
            }
            Err(err) => {
                let summary = json!({
                    "status": "error",
                    "reason": err.to_string(),
                    "stderr": err.stderr().unwrap_or_default(),
                });
                (summary, Some(anyhow!(err).context("SBOM generation failed")))
            }
        };

        write_json(&output_dir.join(SBOM_SUMMARY_FILE), &summary)?;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(summary)
    }
}

struct GovernanceStage {
    evaluation: Option<String>,
    fairness: Option<String>,
    security: Option<String>,
    sbom: Option<String>,
    model: Map<String, Value>,
    notes: Vec<String>,
    output_dir: PathBuf,
}

impl GovernanceStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let model = match params.remove("model") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => bail!("'model' must be a mapping, got {other}"),
        };
        let stage = Self {
            evaluation: take_string(&mut params, "evaluation"),
            fairness: take_string(&mut params, "fairness"),
            security: take_string(&mut params, "security"),
            sbom: take_string(&mut params, "sbom"),
            model,
            notes: take_string_list(&mut params, "policy_notes")?,
            output_dir: take_string(&mut params, "output_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("artifacts/assurance/governance")),
        };
        ensure_consumed("governance", &params)?;
        Ok(stage)
    }

    fn sources(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("evaluation", self.evaluation.as_deref()),
            ("fairness", self.fairness.as_deref()),
            ("security", self.security.as_deref()),
            ("sbom", self.sbom.as_deref()),
        ]
    }
}

fn source_summary(ctx: &RunContext, stage: Option<&str>) -> Value {
    stage
        .and_then(|name| ctx.summary(name))
        .cloned()
        .unwrap_or_else(|| json!({"status": "skipped"}))
}

fn status_of(summary: &Value) -> &str {
    summary
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("completed")
}

/// Notes derived from the collected evidence, after any recipe-provided ones.
fn policy_notes(
    extra: &[String],
    evaluation: Option<&str>,
    fairness: &Value,
    security: &Value,
    sbom: &Value,
) -> Vec<String> {
    let mut notes = extra.to_vec();
    notes.push(match evaluation {
        Some(stage) => format!("Evaluation: metrics taken from stage '{stage}'."),
        None => "Evaluation: no evaluation stage configured.".to_string(),
    });
    notes.push(match (status_of(fairness), fairness["artifact_dir"].as_str()) {
        ("completed", Some(dir)) => format!("Fairness: group metrics and parity differences in {dir}."),
        (status, _) => format!("Fairness: {status}."),
    });
    notes.push(match status_of(security) {
        "completed" => format!(
            "Security: aggregate risk {}; report in {}.",
            security["aggregate_risk_level"].as_str().unwrap_or("unknown"),
            security["report_file"].as_str().unwrap_or("n/a")
        ),
        status => format!("Security: {status}."),
    });
    notes.push(match status_of(sbom) {
        "completed" => format!(
            "Supply chain: CycloneDX SBOM at {}.",
            sbom["sbom_file"].as_str().unwrap_or("n/a")
        ),
        "cyclonedx_missing" => format!(
            "Supply chain: pip freeze fallback at {}; install cyclonedx-bom for a full SBOM.",
            sbom["fallback_freeze"].as_str().unwrap_or("n/a")
        ),
        status => format!("Supply chain: SBOM {status}."),
    });
    notes
}

fn render_markdown(report: &Value) -> String {
    let mut md = String::new();
    md.push_str(&format!(
        "# Model governance summary: {}\n\n",
        report["pipeline"].as_str().unwrap_or("pipeline")
    ));
    md.push_str(&format!(
        "Generated at {}.\n\n",
        report["generated_at"].as_str().unwrap_or_default()
    ));

    if let Some(model) = report["model_overview"].as_object()
        && !model.is_empty()
    {
        md.push_str("## Model\n\n");
        for (key, value) in model {
            let rendered = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            md.push_str(&format!("- {key}: {rendered}\n"));
        }
        md.push('\n');
    }

    md.push_str("## Evidence\n\n");
    if let Some(metrics) = report["evaluation_metrics"].as_object()
        && !metrics.is_empty()
    {
        let rendered: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v}")).collect();
        md.push_str(&format!("- Evaluation: {}\n", rendered.join(", ")));
    } else {
        md.push_str("- Evaluation: no metrics recorded\n");
    }

    let fairness = &report["fairness"];
    md.push_str(&format!(
        "- Fairness: {} -> {}\n",
        status_of(fairness),
        fairness["artifact_dir"].as_str().unwrap_or("n/a")
    ));
    let security = &report["security"];
    md.push_str(&format!(
        "- Security: {} (aggregate risk: {}) -> {}\n",
        status_of(security),
        security["aggregate_risk_level"].as_str().unwrap_or("n/a"),
        security["report_file"].as_str().unwrap_or("n/a")
    ));
    let sbom = &report["sbom"];
    md.push_str(&format!(
        "- SBOM: {} -> {}\n",
        status_of(sbom),
        sbom["sbom_file"]
            .as_str()
            .or_else(|| sbom["fallback_freeze"].as_str())
            .unwrap_or("n/a")
    ));

    if let Some(notes) = report["policy_notes"].as_array()
        && !notes.is_empty()
    {
        md.push_str("\n## Policy notes\n\n");
        for note in notes.iter().filter_map(Value::as_str) {
            md.push_str(&format!("- {note}\n"));
        }
    }
    md
}

impl Stage for GovernanceStage {
    fn kind(&self) -> &'static str {
        "governance"
    }

    fn describe(&self) -> String {
        let sources: Vec<String> = self
            .sources()
            .iter()
            .filter_map(|(key, stage)| stage.map(|s| format!("{key}={s}")))
            .collect();
        format!("governance report from [{}]", sources.join(", "))
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let evaluation = source_summary(ctx, self.evaluation.as_deref());
        let evaluation_metrics = evaluation
            .get("metrics")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let fairness = source_summary(ctx, self.fairness.as_deref());
        let security = source_summary(ctx, self.security.as_deref());
        let sbom = source_summary(ctx, self.sbom.as_deref());
        let notes = policy_notes(
            &self.notes,
            self.evaluation.as_deref(),
            &fairness,
            &security,
            &sbom,
        );

        let report = json!({
            "status": "completed",
            "pipeline": ctx.pipeline,
            "generated_at": Utc::now().to_rfc3339(),
            "model_overview": self.model,
            "evaluation": evaluation,
            "evaluation_metrics": evaluation_metrics,
            "fairness": fairness,
            "security": security,
            "sbom": sbom,
            "policy_notes": notes,
        });

        let output_dir = ctx.resolve_path(&self.output_dir);
        let json_path = output_dir.join(GOVERNANCE_JSON_FILE);
        write_json(&json_path, &report)?;
        let md_path = output_dir.join(GOVERNANCE_MD_FILE);
        fs::write(&md_path, render_markdown(&report))
            .with_context(|| format!("Failed to write {}", md_path.display()))?;
        info!(report = %json_path.display(), "Governance report written");

        Ok(json!({
            "status": "completed",
            "report_file": path_string(&json_path),
            "markdown_file": path_string(&md_path),
        }))
    }
}

/// Sources a governance stage reads, for validation.
pub fn governance_sources(params: &StageParameters) -> Vec<(String, String)> {
    ["evaluation", "fairness", "security", "sbom"]
        .iter()
        .filter_map(|key| {
            params
                .get(*key)
                .and_then(Value::as_str)
                .map(|stage| (key.to_string(), stage.to_string()))
        })
        .collect()
}
