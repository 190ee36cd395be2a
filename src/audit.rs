//! Data provenance and model-risk heuristics mapped to the OWASP ML Top 10.
//!
//! The checks are deliberately cheap: they run on the CSV splits a training
//! stage leaves behind and never load a model.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dataset::{Table, mean, quantile, std_dev, variance};

pub const POISONING_RISK: &str = "OWASP-ML02-DataPoisoning";
pub const PRIVACY_RISK: &str = "OWASP-ML03-ML04-Privacy";
pub const REPORT_FILE: &str = "mlsecops_security_report.json";

const MAJORITY_CLASS_LIMIT: f64 = 0.75;
const IQR_FENCE: f64 = 3.0;
const TOP_CATEGORIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScore {
    pub name: String,
    pub level: RiskLevel,
    pub details: Value,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryShare {
    pub value: String,
    pub share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitManifest {
    pub rows: usize,
    pub hash: String,
    pub numeric_stats: BTreeMap<String, ColumnStats>,
    pub categorical_distribution: BTreeMap<String, Vec<CategoryShare>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataManifest {
    pub train: SplitManifest,
    pub test: SplitManifest,
}

pub fn build_manifest(
    train: &Table,
    test: &Table,
    numeric_columns: &[String],
    categorical_columns: &[String],
) -> Result<DataManifest> {
    Ok(DataManifest {
        train: summarize_split(train, numeric_columns, categorical_columns)
            .context("Failed to summarize train split")?,
        test: summarize_split(test, numeric_columns, categorical_columns)
            .context("Failed to summarize test split")?,
    })
}

fn summarize_split(
    table: &Table,
    numeric_columns: &[String],
    categorical_columns: &[String],
) -> Result<SplitManifest> {
    let mut numeric_stats = BTreeMap::new();
    for column in numeric_columns {
        let values = table.numeric_column(column)?;
        if values.is_empty() {
            continue;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        numeric_stats.insert(
            column.clone(),
            ColumnStats {
                min,
                max,
                mean: mean(&values),
                std: std_dev(&values),
            },
        );
    }

    let mut categorical_distribution = BTreeMap::new();
    for column in categorical_columns {
        let values = table.column(column)?;
        let mut shares: Vec<CategoryShare> = frequencies(&values)
            .into_iter()
            .map(|(value, share)| CategoryShare { value, share })
            .collect();
        shares.sort_by(|a, b| b.share.total_cmp(&a.share).then_with(|| a.value.cmp(&b.value)));
        shares.truncate(TOP_CATEGORIES);
        categorical_distribution.insert(column.clone(), shares);
    }

    Ok(SplitManifest {
        rows: table.len(),
        hash: table.content_hash(),
        numeric_stats,
        categorical_distribution,
    })
}

fn frequencies(values: &[&str]) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for value in values {
        *counts.entry((*value).to_string()).or_default() += 1;
    }
    let total = values.len().max(1) as f64;
    counts
        .into_iter()
        .map(|(value, count)| (value, count as f64 / total))
        .collect()
}

/// OWASP ML02 indicators: duplicated rows, a dominant label, and numeric
/// values far outside the interquartile range.
pub fn scan_for_data_poisoning(
    table: &Table,
    label_column: &str,
    numeric_columns: &[String],
) -> Result<RiskScore> {
    let mut issues = Vec::new();

    let mut seen = HashSet::new();
    let duplicate_rows = table
        .rows()
        .iter()
        .filter(|row| !seen.insert(row.as_slice()))
        .count();
    if duplicate_rows > 0 {
        issues.push(format!("{duplicate_rows} duplicated rows detected."));
    }

    let class_balance = frequencies(&table.column(label_column)?);
    let majority = class_balance.values().copied().fold(0.0, f64::max);
    if majority > MAJORITY_CLASS_LIMIT {
        issues.push(format!(
            "Label imbalance detected (majority class frequency={majority:.2})."
        ));
    }

    let mut outlier_rows = 0usize;
    for column in numeric_columns {
        let values = table.numeric_column(column)?;
        let (Some(q1), Some(q3)) = (quantile(&values, 0.25), quantile(&values, 0.75)) else {
            continue;
        };
        let iqr = q3 - q1;
        let lower = q1 - IQR_FENCE * iqr;
        let upper = q3 + IQR_FENCE * iqr;
        outlier_rows += values.iter().filter(|v| **v < lower || **v > upper).count();
    }
    if outlier_rows > 0 {
        issues.push(format!(
            "{outlier_rows} numeric rows outside 3*IQR boundaries."
        ));
    }

    let level = match issues.len() {
        0 => RiskLevel::Low,
        1 => RiskLevel::Medium,
        _ => RiskLevel::High,
    };

    Ok(RiskScore {
        name: POISONING_RISK.to_string(),
        level,
        details: json!({"issues": issues, "class_balance": class_balance}),
        recommendations: vec![
            "Review upstream data sources and retrace provenance chain.".into(),
            "Validate contributor identities for user-generated data.".into(),
            "Regenerate dataset from trusted sources if tampering is confirmed.".into(),
        ],
    })
}

/// OWASP ML03/ML04 exposure estimated from the gap between the model's
/// confidence on training rows and on held-out rows.
pub fn evaluate_membership_inference(
    train_confidence: &[f64],
    test_confidence: &[f64],
) -> Result<RiskScore> {
    if train_confidence.is_empty() || test_confidence.is_empty() {
        bail!("Membership inference needs non-empty train and test confidences");
    }
    let train_mean = mean(train_confidence);
    let test_mean = mean(test_confidence);
    let confidence_gap = train_mean - test_mean;
    let variance_gap = variance(train_confidence) - variance(test_confidence);

    let level = if confidence_gap > 0.15 {
        RiskLevel::High
    } else if confidence_gap > 0.08 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    Ok(RiskScore {
        name: PRIVACY_RISK.to_string(),
        level,
        details: json!({
            "train_confidence_mean": train_mean,
            "test_confidence_mean": test_mean,
            "confidence_gap": confidence_gap,
            "variance_gap": variance_gap,
        }),
        recommendations: vec![
            "Reduce overfitting (regularisation, more data, early stopping).".into(),
            "Consider confidence clipping or logit rounding on inference APIs.".into(),
            "Add differential privacy noise before exposing model outputs.".into(),
        ],
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    pub manifest: DataManifest,
    pub risks: Vec<RiskScore>,
    pub aggregate_risk_level: RiskLevel,
    pub owasp_mappings: Vec<String>,
    pub mitre_atlas_focus: Vec<String>,
}

pub fn assemble_security_report(manifest: DataManifest, risks: Vec<RiskScore>) -> SecurityReport {
    let aggregate_risk_level = risks
        .iter()
        .map(|r| r.level)
        .max()
        .unwrap_or(RiskLevel::Low);
    let owasp_mappings = risks.iter().map(|r| r.name.clone()).collect();
    SecurityReport {
        manifest,
        risks,
        aggregate_risk_level,
        owasp_mappings,
        mitre_atlas_focus: vec![
            "ML Attack Staging".into(),
            "ML Model Access".into(),
            "ML Attack Execution".into(),
        ],
    }
}

pub fn write_security_report(report: &SecurityReport, output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create report directory: {}", output_dir.display()))?;
    let path = output_dir.join(REPORT_FILE);
    let file = fs::File::create(&path)
        .with_context(|| format!("Failed to create security report: {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)
        .with_context(|| format!("Failed to write security report: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(csv: &str) -> Table {
        Table::from_reader(csv.as_bytes()).unwrap()
    }

    fn skewed() -> Table {
        let mut csv = String::from("tenure,plan,label\n");
        for (idx, value) in [1, 2, 3, 4, 5, 6, 7, 8, 9, 100].iter().enumerate() {
            let label = if idx < 8 { "no" } else { "yes" };
            csv.push_str(&format!("{value},basic,{label}\n"));
        }
        table(&csv)
    }

    #[test]
    fn poisoning_scan_flags_imbalance_and_outliers() {
        let risk = scan_for_data_poisoning(&skewed(), "label", &["tenure".to_string()]).unwrap();
        assert_eq!(risk.level, RiskLevel::High);
        let issues = risk.details["issues"].as_array().unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(
            issues[0].as_str().unwrap(),
            "Label imbalance detected (majority class frequency=0.80)."
        );
        assert_eq!(
            issues[1].as_str().unwrap(),
            "1 numeric rows outside 3*IQR boundaries."
        );
        assert_eq!(risk.details["class_balance"]["no"], 0.8);
    }

    #[test]
    fn poisoning_scan_counts_duplicates() {
        let data = table("tenure,label\n1,yes\n2,no\n1,yes\n3,no\n");
        let risk = scan_for_data_poisoning(&data, "label", &["tenure".to_string()]).unwrap();
        assert_eq!(risk.level, RiskLevel::Medium);
        assert_eq!(risk.details["issues"][0], "1 duplicated rows detected.");
    }

    #[test]
    fn clean_data_is_low_risk() {
        let data = table("tenure,label\n1,yes\n2,no\n3,yes\n4,no\n");
        let risk = scan_for_data_poisoning(&data, "label", &["tenure".to_string()]).unwrap();
        assert_eq!(risk.level, RiskLevel::Low);
    }

    #[test]
    fn membership_gap_levels() {
        let high = evaluate_membership_inference(&[0.9, 0.95, 0.85], &[0.7, 0.72, 0.68]).unwrap();
        assert_eq!(high.level, RiskLevel::High);
        let medium = evaluate_membership_inference(&[0.9], &[0.8]).unwrap();
        assert_eq!(medium.level, RiskLevel::Medium);
        let low = evaluate_membership_inference(&[0.8], &[0.78]).unwrap();
        assert_eq!(low.level, RiskLevel::Low);
        assert!(evaluate_membership_inference(&[], &[0.5]).is_err());
    }

    #[test]
    fn manifest_keeps_top_categories_by_share() {
        let data = table("plan,tenure\na,1\nb,2\nb,3\nc,4\nd,5\ne,6\nf,7\nb,8\n");
        let manifest = build_manifest(
            &data,
            &data,
            &["tenure".to_string()],
            &["plan".to_string()],
        )
        .unwrap();
        let plan = &manifest.train.categorical_distribution["plan"];
        assert_eq!(plan.len(), 5);
        assert_eq!(plan[0].value, "b");
        assert_eq!(plan[0].share, 3.0 / 8.0);
        assert_eq!(plan[1].value, "a");
        let tenure = &manifest.test.numeric_stats["tenure"];
        assert_eq!(tenure.min, 1.0);
        assert_eq!(tenure.max, 8.0);
        assert_eq!(tenure.mean, 4.5);
        assert_eq!(manifest.train.hash, manifest.test.hash);
    }

    #[test]
    fn aggregate_level_is_the_worst_risk() {
        let data = skewed();
        let manifest = build_manifest(&data, &data, &[], &[]).unwrap();
        let risks = vec![
            evaluate_membership_inference(&[0.8], &[0.78]).unwrap(),
            evaluate_membership_inference(&[0.9], &[0.8]).unwrap(),
        ];
        let report = assemble_security_report(manifest.clone(), risks);
        assert_eq!(report.aggregate_risk_level, RiskLevel::Medium);
        assert_eq!(report.owasp_mappings, vec![PRIVACY_RISK, PRIVACY_RISK]);

        let empty = assemble_security_report(manifest, Vec::new());
        assert_eq!(empty.aggregate_risk_level, RiskLevel::Low);
    }
}
