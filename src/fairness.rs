//! Group fairness metrics over binary predictions.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const REPORT_FILE: &str = "fairlearn_report.json";

/// Positive class: `yes` when present, else the last label in sorted order.
pub fn positive_label<S: AsRef<str>>(labels: &[S]) -> String {
    let mut distinct: Vec<String> = labels
        .iter()
        .map(|l| l.as_ref().trim().to_lowercase())
        .collect();
    distinct.sort();
    distinct.dedup();
    if distinct.iter().any(|l| l == "yes") {
        return "yes".to_string();
    }
    distinct.pop().unwrap_or_else(|| "positive".to_string())
}

pub fn binarize<S: AsRef<str>>(values: &[S], positive: &str) -> Vec<bool> {
    let positive = positive.trim().to_lowercase();
    values
        .iter()
        .map(|v| v.as_ref().trim().to_lowercase() == positive)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Confusion {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
}

impl Confusion {
    fn tally(y_true: &[bool], y_pred: &[bool]) -> Self {
        let mut c = Confusion::default();
        for (&truth, &pred) in y_true.iter().zip(y_pred) {
            match (truth, pred) {
                (true, true) => c.tp += 1,
                (false, true) => c.fp += 1,
                (false, false) => c.tn += 1,
                (true, false) => c.fn_ += 1,
            }
        }
        c
    }

    fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    fn false_positive_rate(&self) -> f64 {
        ratio(self.fp, self.fp + self.tn)
    }

    fn selection_rate(&self) -> f64 {
        ratio(self.tp + self.fp, self.total())
    }

    fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverallMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMetrics {
    pub group: String,
    pub count: usize,
    pub accuracy: f64,
    pub selection_rate: f64,
    pub true_positive_rate: f64,
    pub false_positive_rate: f64,
}

impl GroupMetrics {
    fn from_confusion(group: impl Into<String>, c: &Confusion) -> Self {
        Self {
            group: group.into(),
            count: c.total(),
            accuracy: c.accuracy(),
            selection_rate: c.selection_rate(),
            true_positive_rate: c.recall(),
            false_positive_rate: c.false_positive_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disparity {
    pub demographic_parity_difference: f64,
    pub equalized_odds_difference: f64,
    pub equal_opportunity_difference: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFairness {
    pub overall: GroupMetrics,
    pub by_group: Vec<GroupMetrics>,
    pub disparity: Disparity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_group_csv: Option<String>,
}

pub fn overall_metrics(y_true: &[bool], y_pred: &[bool]) -> OverallMetrics {
    let c = Confusion::tally(y_true, y_pred);
    OverallMetrics {
        accuracy: c.accuracy(),
        precision: c.precision(),
        recall: c.recall(),
        f1: c.f1(),
    }
}

/// Per-group metrics and the spread of each rate across groups.
pub fn evaluate_feature<S: AsRef<str>>(
    y_true: &[bool],
    y_pred: &[bool],
    sensitive: &[S],
) -> Result<FeatureFairness> {
    if y_true.len() != y_pred.len() || y_true.len() != sensitive.len() {
        bail!(
            "Length mismatch: {} labels, {} predictions, {} sensitive values",
            y_true.len(),
            y_pred.len(),
            sensitive.len()
        );
    }

    let mut groups: BTreeMap<String, (Vec<bool>, Vec<bool>)> = BTreeMap::new();
    for ((truth, pred), group) in y_true.iter().zip(y_pred).zip(sensitive) {
        let entry = groups.entry(group.as_ref().to_string()).or_default();
        entry.0.push(*truth);
        entry.1.push(*pred);
    }

    let by_group: Vec<GroupMetrics> = groups
        .iter()
        .map(|(name, (t, p))| GroupMetrics::from_confusion(name.clone(), &Confusion::tally(t, p)))
        .collect();

    let spread = |select: fn(&GroupMetrics) -> f64| -> f64 {
        let values: Vec<f64> = by_group.iter().map(select).collect();
        if values.is_empty() {
            return 0.0;
        }
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        max - min
    };

    let tpr_spread = spread(|g| g.true_positive_rate);
    let fpr_spread = spread(|g| g.false_positive_rate);
    let disparity = Disparity {
        demographic_parity_difference: spread(|g| g.selection_rate),
        equalized_odds_difference: tpr_spread.max(fpr_spread),
        equal_opportunity_difference: tpr_spread,
    };

    Ok(FeatureFairness {
        overall: GroupMetrics::from_confusion("overall", &Confusion::tally(y_true, y_pred)),
        by_group,
        disparity,
        by_group_csv: None,
    })
}

pub fn write_group_csv(path: &Path, feature: &str, groups: &[GroupMetrics]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create fairness CSV: {}", path.display()))?;
    writer.write_record([
        feature,
        "count",
        "accuracy",
        "selection_rate",
        "true_positive_rate",
        "false_positive_rate",
    ])?;
    for g in groups {
        writer.write_record([
            g.group.clone(),
            g.count.to_string(),
            g.accuracy.to_string(),
            g.selection_rate.to_string(),
            g.true_positive_rate.to_string(),
            g.false_positive_rate.to_string(),
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write fairness CSV: {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairnessReport {
    pub status: String,
    pub positive_label: String,
    pub overall: OverallMetrics,
    pub features: BTreeMap<String, FeatureFairness>,
    pub artifact_dir: String,
}

impl FairnessReport {
    /// Largest demographic parity difference across features.
    pub fn worst_demographic_parity(&self) -> Option<(&str, f64)> {
        self.features
            .iter()
            .map(|(name, f)| (name.as_str(), f.disparity.demographic_parity_difference))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Vec<bool>, Vec<bool>, Vec<&'static str>) {
        let y_true = vec![true, true, false, false, true, true, false, false];
        let y_pred = vec![true, false, false, false, true, true, true, false];
        let region = vec!["north", "north", "north", "north", "south", "south", "south", "south"];
        (y_true, y_pred, region)
    }

    #[test]
    fn positive_label_prefers_yes() {
        assert_eq!(positive_label(&["no", "Yes"]), "yes");
        assert_eq!(positive_label(&["churn", "stay"]), "stay");
        assert_eq!(positive_label::<&str>(&[]), "positive");
        assert_eq!(binarize(&["YES", "no", " yes "], "yes"), vec![true, false, true]);
    }

    #[test]
    fn overall_metrics_from_confusion() {
        let (y_true, y_pred, _) = fixture();
        let overall = overall_metrics(&y_true, &y_pred);
        assert_eq!(overall.accuracy, 0.75);
        assert_eq!(overall.precision, 0.75);
        assert_eq!(overall.recall, 0.75);
        assert_eq!(overall.f1, 0.75);
    }

    #[test]
    fn disparities_are_group_spreads() {
        let (y_true, y_pred, region) = fixture();
        let fairness = evaluate_feature(&y_true, &y_pred, &region).unwrap();
        assert_eq!(fairness.by_group.len(), 2);
        let north = &fairness.by_group[0];
        assert_eq!(north.group, "north");
        assert_eq!(north.true_positive_rate, 0.5);
        assert_eq!(north.false_positive_rate, 0.0);
        assert_eq!(north.selection_rate, 0.25);
        let south = &fairness.by_group[1];
        assert_eq!(south.true_positive_rate, 1.0);
        assert_eq!(south.false_positive_rate, 0.5);
        assert_eq!(fairness.disparity.demographic_parity_difference, 0.5);
        assert_eq!(fairness.disparity.equalized_odds_difference, 0.5);
        assert_eq!(fairness.disparity.equal_opportunity_difference, 0.5);
        assert_eq!(fairness.overall.count, 8);
    }

    #[test]
    fn rates_without_positives_are_zero() {
        let fairness = evaluate_feature(&[false, false], &[false, true], &["a", "a"]).unwrap();
        assert_eq!(fairness.by_group[0].true_positive_rate, 0.0);
        assert_eq!(fairness.by_group[0].false_positive_rate, 0.5);
        assert!(evaluate_feature(&[true], &[true, false], &["a"]).is_err());
    }
}
