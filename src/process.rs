use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::security::SecretMasker;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Program '{program}' was not found on PATH")]
    NotFound { program: String },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with status {code}{}", reason(.stderr))]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("'{command}' was terminated by a signal{}", reason(.stderr))]
    Signal { command: String, stderr: String },
}

const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_CHARS: usize = 2_000;

/// Last few non-empty lines of a child's stderr, capped in length.
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join("\n");
    let skip = tail.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    tail.chars().skip(skip).collect()
}

fn reason(stderr: &str) -> String {
    let tail = stderr_tail(stderr);
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

impl ProcessError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcessError::NotFound { .. })
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::Exit { stderr, .. } | ProcessError::Signal { stderr, .. } => {
                Some(stderr.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    /// Shell-like rendering used in logs and summaries.
    pub fn display(&self) -> String {
        let mut rendered = quote(&self.program);
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&quote(arg));
        }
        rendered
    }
}

fn quote(token: &str) -> String {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        format!("'{}'", token.replace('\'', "'\\''"))
    } else {
        token.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip)]
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn into_result(self) -> Result<Self, ProcessError> {
        match self.exit_code {
            Some(0) => Ok(self),
            Some(code) => Err(ProcessError::Exit {
                command: self.command,
                code,
                stderr: self.stderr,
            }),
            None => Err(ProcessError::Signal {
                command: self.command,
                stderr: self.stderr,
            }),
        }
    }
}

/// Run `spec` to completion, capturing and logging its output. A non-zero
/// exit is not an error here; use [`run_checked`] for that.
pub fn run_process(spec: &ProcessSpec, masker: &SecretMasker) -> Result<ProcessOutput, ProcessError> {
    let command_line = masker.mask(&spec.display());
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    info!(command = %command_line, "Invoking external process");
    let started = Instant::now();
    let output = command.output().map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ProcessError::NotFound {
                program: spec.program.clone(),
            }
        } else {
            ProcessError::Spawn {
                program: spec.program.clone(),
                source,
            }
        }
    })?;
    let duration = started.elapsed();

    let stdout = masker.mask(&String::from_utf8_lossy(&output.stdout));
    let stderr = masker.mask(&String::from_utf8_lossy(&output.stderr));
    for line in stdout.lines() {
        debug!(target: "mlsecops_runner::stdout", "{line}");
    }
    for line in stderr.lines() {
        debug!(target: "mlsecops_runner::stderr", "{line}");
    }

    if let Some(path) = &spec.log_file
        && let Err(err) = append_log(path, &command_line, &stdout, &stderr)
    {
        warn!(log = %path.display(), error = %err, "Failed to write process log");
    }

    let exit_code = output.status.code();
    if exit_code != Some(0) {
        let tail = stderr_tail(&stderr);
        if !tail.is_empty() {
            warn!(command = %command_line, ?exit_code, stderr = %tail, "External process failed");
        }
    }
    debug!(
        command = %command_line,
        ?exit_code,
        duration_ms = duration.as_secs_f64() * 1_000.0,
        "External process finished"
    );

    Ok(ProcessOutput {
        command: command_line,
        exit_code,
        stdout,
        stderr,
        duration,
    })
}

/// Run `spec` and turn a non-zero exit into [`ProcessError::Exit`].
pub fn run_checked(spec: &ProcessSpec, masker: &SecretMasker) -> Result<ProcessOutput, ProcessError> {
    run_process(spec, masker)?.into_result()
}

fn append_log(path: &Path, command: &str, stdout: &str, stderr: &str) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "$ {command}")?;
    file.write_all(stdout.as_bytes())?;
    if !stderr.is_empty() {
        writeln!(file, "--- stderr ---")?;
        file.write_all(stderr.as_bytes())?;
    }
    Ok(())
}

/// Platform shell invocation for a single command string.
pub fn shell_spec(script: &str) -> ProcessSpec {
    if cfg!(windows) {
        ProcessSpec::new("cmd").args(["/C", script])
    } else {
        ProcessSpec::new("sh").args(["-c", script])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let spec = ProcessSpec::new("git").args(["commit", "-m", "track artifacts"]);
        assert_eq!(spec.display(), "git commit -m 'track artifacts'");
    }

    #[test]
    fn missing_program_is_reported_as_not_found() {
        let spec = ProcessSpec::new("definitely-not-an-installed-tool-4242");
        let err = run_process(&spec, &SecretMasker::default()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_an_error_when_checked() {
        let spec = shell_spec("echo boom >&2; exit 3");
        let err = run_checked(&spec, &SecretMasker::default()).unwrap_err();
        match err {
            ProcessError::Exit { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn failure_message_carries_the_stderr_tail() {
        let masker = SecretMasker::new(["hunter2".to_string()]);
        let spec = shell_spec("echo progress; echo 'ERROR: resolver conflict for hunter2' >&2; exit 1");
        let err = run_checked(&spec, &masker).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with status 1: ERROR: resolver conflict"), "{message}");
        assert!(!message.contains("hunter2"), "{message}");
        assert!(!message.contains("progress"), "{message}");
    }

    #[test]
    fn stderr_tail_keeps_the_last_lines() {
        let noisy: String = (1..=50).map(|n| format!("line {n}\n\n")).collect();
        let tail = stderr_tail(&noisy);
        assert_eq!(tail.lines().count(), 20);
        assert!(tail.starts_with("line 31"));
        assert!(tail.ends_with("line 50"));
        assert_eq!(stderr_tail("  \n"), "");

        let long = "x".repeat(5_000);
        assert_eq!(stderr_tail(&long).len(), 2_000);
    }

    #[cfg(unix)]
    #[test]
    fn secrets_are_masked_in_captured_output() {
        let masker = SecretMasker::new(["hunter2".to_string()]);
        let spec = shell_spec("echo token=hunter2");
        let output = run_checked(&spec, &masker).unwrap();
        assert_eq!(output.stdout.trim(), "token=***");
        assert!(!output.command.contains("hunter2"));
    }
}
