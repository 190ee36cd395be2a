//! Run environment resolution and `${VAR}` interpolation.
//!
//! Variables are layered: process environment, then an optional env file,
//! then the recipe `env:` block (evaluated top to bottom), then command line
//! overrides. Only the non-process layers are exported to child processes;
//! children inherit the process environment on their own.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid variable pattern")
});

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier pattern"));

pub fn is_valid_name(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// `1`, `true`, `yes` and `on` (any case) enable a flag.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a `KEY=VALUE` command line assignment.
pub fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if !is_valid_name(key) {
        return Err(format!("'{key}' is not a valid environment variable name"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct RunEnvironment {
    exported: BTreeMap<String, String>,
}

impl RunEnvironment {
    pub fn resolve(
        recipe_env: &[(String, String)],
        env_file: Option<&Path>,
        overrides: &[(String, String)],
    ) -> Result<Self> {
        let mut env = RunEnvironment::default();

        if let Some(path) = env_file {
            let entries = dotenvy::from_path_iter(path)
                .with_context(|| format!("Failed to open env file: {}", path.display()))?;
            for entry in entries {
                let (key, value) = entry
                    .with_context(|| format!("Failed to parse env file: {}", path.display()))?;
                env.exported.insert(key, value);
            }
            debug!(env_file = %path.display(), "Env file loaded");
        }

        for (key, raw) in recipe_env {
            let value = interpolate(raw, |name| env.lookup(name))
                .with_context(|| format!("Failed to resolve recipe env '{key}'"))?;
            env.exported.insert(key.clone(), value);
        }

        for (key, value) in overrides {
            env.exported.insert(key.clone(), value.clone());
        }

        Ok(env)
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.exported
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    pub fn flag(&self, name: &str) -> bool {
        self.lookup(name).map(|v| is_truthy(&v)).unwrap_or(false)
    }

    pub fn exported(&self) -> &BTreeMap<String, String> {
        &self.exported
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.exported.insert(key.into(), value.into());
    }

    pub fn interpolate_value(&self, value: &mut Value) -> Result<()> {
        interpolate_value(value, &|name: &str| self.lookup(name))
    }
}

/// Expand `${VAR}` and `${VAR:-default}`. Undefined variables without a
/// default are an error.
pub fn interpolate<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let expanded = expand(input, &lookup, &mut missing);
    if !missing.is_empty() {
        bail!("Undefined variable(s): {}", missing.join(", "));
    }
    Ok(expanded)
}

/// Like [`interpolate`] but substitutes an empty string for undefined
/// variables and reports their names.
pub fn interpolate_lenient<F>(input: &str, lookup: F) -> (String, Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let expanded = expand(input, &lookup, &mut missing);
    (expanded, missing)
}

fn expand<F>(input: &str, lookup: &F, missing: &mut Vec<String>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    VARIABLE
        .replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            match (lookup(name), caps.get(2)) {
                (Some(value), _) if !value.is_empty() || caps.get(2).is_none() => value,
                (_, Some(default)) => default.as_str().to_string(),
                (Some(value), None) => value,
                (None, None) => {
                    if !missing.iter().any(|m| m == name) {
                        missing.push(name.to_string());
                    }
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Interpolate every string inside a JSON value in place.
pub fn interpolate_value<F>(value: &mut Value, lookup: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            let expanded = interpolate(s, lookup).map_err(|err| anyhow!("{err} in '{s}'"))?;
            *s = expanded;
        }
        Value::Array(items) => {
            for item in items {
                interpolate_value(item, lookup)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                interpolate_value(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Lenient counterpart of [`interpolate_value`]: undefined variables expand
/// to an empty string and their names are collected into `missing`.
pub fn interpolate_value_lenient<F>(value: &mut Value, lookup: &F, missing: &mut Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            let (expanded, names) = interpolate_lenient(s, lookup);
            for name in names {
                if !missing.contains(&name) {
                    missing.push(name);
                }
            }
            *s = expanded;
        }
        Value::Array(items) => {
            for item in items {
                interpolate_value_lenient(item, lookup, missing);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                interpolate_value_lenient(item, lookup, missing);
            }
        }
        _ => {}
    }
}
