use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use sha2::{Digest, Sha256};

/// A CSV file held in memory as rows of strings.
#[derive(Debug, Clone, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != headers.len() {
                bail!(
                    "Row {} has {} field(s), expected {}",
                    idx + 1,
                    row.len(),
                    headers.len()
                );
            }
        }
        Ok(Self { headers, rows })
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("Failed to parse CSV: {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Self::new(headers, rows)
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| anyhow!("Column '{name}' not found"))?;
        Ok(self.rows.iter().map(|row| row[idx].as_str()).collect())
    }

    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>> {
        self.column(name)?
            .into_iter()
            .enumerate()
            .map(|(idx, raw)| {
                raw.parse::<f64>().map_err(|_| {
                    anyhow!(
                        "Column '{name}' row {} is not numeric: '{raw}'",
                        idx + 1
                    )
                })
            })
            .collect()
    }

    /// Digest of headers and rows independent of CSV quoting and line endings.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.headers.join("\u{1f}").as_bytes());
        for row in &self.rows {
            hasher.update(b"\n");
            hasher.update(row.join("\u{1f}").as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (divides by `n`).
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Quantile with linear interpolation between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "age,region,label\n34, north ,yes\n51,south,no\n";

    #[test]
    fn reads_columns_and_trims_fields() {
        let table = Table::from_reader(CSV.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("region").unwrap(), vec!["north", "south"]);
        assert_eq!(table.numeric_column("age").unwrap(), vec![34.0, 51.0]);
        assert!(table.numeric_column("region").is_err());
        assert!(table.column("missing").is_err());
    }

    #[test]
    fn content_hash_ignores_quoting() {
        let quoted = "age,region,label\n\"34\",\"north\",yes\n51,south,no\n";
        let a = Table::from_reader(CSV.as_bytes()).unwrap();
        let b = Table::from_reader(quoted.as_bytes()).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 100.0];
        assert_eq!(quantile(&values, 0.25), Some(3.25));
        assert_eq!(quantile(&values, 0.75), Some(7.75));
        assert_eq!(quantile(&[], 0.5), None);
        assert!((std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-12);
    }
}
