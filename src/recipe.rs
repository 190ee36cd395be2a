use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::pipeline::StageSpec;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Recipe {
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: serde_yaml::Mapping,
    #[serde(default)]
    pub secrets: Vec<String>,
    pub stages: Vec<StageSpec>,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let mut recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        recipe.source = Some(path.to_path_buf());
        Ok(recipe)
    }

    /// Pipeline name: the declared one, else the recipe file stem.
    pub fn pipeline_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| {
                self.source
                    .as_ref()
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "pipeline".to_string())
    }

    /// Working directory, resolved against the recipe file's directory.
    pub fn resolve_workdir(&self) -> PathBuf {
        let base = self
            .source
            .as_ref()
            .and_then(|p| p.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        match &self.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base,
        }
    }

    /// `env:` entries in declaration order with scalar values rendered as strings.
    pub fn env_pairs(&self) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::with_capacity(self.env.len());
        for (key, value) in &self.env {
            let key = match key {
                serde_yaml::Value::String(s) => s.clone(),
                other => bail!("Recipe env keys must be strings, got {:?}", other),
            };
            let value = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => String::new(),
                _ => bail!("Recipe env '{key}' must be a scalar value"),
            };
            pairs.push((key, value));
        }
        Ok(pairs)
    }
}
