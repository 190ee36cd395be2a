use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use zip::write::{FileOptions, ZipWriter};

use super::{ensure_consumed, process_summary, take_bool, take_string, take_string_list};
use crate::pipeline::{RunContext, Stage, StageParameters, StageRegistry};
use crate::process::{run_checked, run_process};
use crate::security::compute_sha256;

pub const ARCHIVE_MANIFEST_FILE: &str = "archive_manifest.json";

pub fn register(registry: &mut StageRegistry) {
    registry.register("data-pull", |params| {
        Ok(Box::new(DataPullStage::from_params(params)?))
    });
    registry.register("dvc-track", |params| {
        Ok(Box::new(DvcTrackStage::from_params(params)?))
    });
    registry.register("git-publish", |params| {
        Ok(Box::new(GitPublishStage::from_params(params)?))
    });
    registry.register("archive", |params| {
        Ok(Box::new(ArchiveStage::from_params(params)?))
    });
}

fn remote_args(remote: Option<&String>) -> Vec<String> {
    remote
        .map(|r| vec!["-r".to_string(), r.clone()])
        .unwrap_or_default()
}

struct DataPullStage {
    dvc_bin: String,
    remote: Option<String>,
    targets: Vec<String>,
}

impl DataPullStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let stage = Self {
            dvc_bin: take_string(&mut params, "dvc_bin").unwrap_or_else(|| "dvc".to_string()),
            remote: take_string(&mut params, "remote").filter(|r| !r.is_empty()),
            targets: take_string_list(&mut params, "targets")?,
        };
        ensure_consumed("data-pull", &params)?;
        Ok(stage)
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["pull".to_string()];
        args.extend(remote_args(self.remote.as_ref()));
        args.extend(self.targets.iter().cloned());
        args
    }
}

impl Stage for DataPullStage {
    fn kind(&self) -> &'static str {
        "data-pull"
    }

    fn describe(&self) -> String {
        format!("{} {}", self.dvc_bin, self.args().join(" "))
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let spec = ctx.process(self.dvc_bin.clone()).args(self.args());
        let output = run_checked(&spec, &ctx.masker)?;
        Ok(process_summary(&output))
    }
}

struct DvcTrackStage {
    dvc_bin: String,
    paths: Vec<String>,
    remote: Option<String>,
    push: bool,
}

impl DvcTrackStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let paths = take_string_list(&mut params, "paths")?;
        if paths.is_empty() {
            bail!("dvc-track stage requires at least one entry in 'paths'");
        }
        let stage = Self {
            dvc_bin: take_string(&mut params, "dvc_bin").unwrap_or_else(|| "dvc".to_string()),
            paths,
            remote: take_string(&mut params, "remote").filter(|r| !r.is_empty()),
            push: take_bool(&mut params, "push")?.unwrap_or(false),
        };
        ensure_consumed("dvc-track", &params)?;
        Ok(stage)
    }
}

impl Stage for DvcTrackStage {
    fn kind(&self) -> &'static str {
        "dvc-track"
    }

    fn describe(&self) -> String {
        let mut plan = format!("{} add {}", self.dvc_bin, self.paths.join(" "));
        if self.push {
            plan.push_str(" && push");
        }
        plan
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let mut tracked = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let spec = ctx.process(self.dvc_bin.clone()).args(["add", path.as_str()]);
            run_checked(&spec, &ctx.masker)
                .with_context(|| format!("Failed to track '{path}' with {}", self.dvc_bin))?;
            let pointer = format!("{path}.dvc");
            tracked.push(json!({
                "path": path,
                "pointer": ctx.resolve_path(&pointer).is_file().then_some(pointer),
            }));
        }

        if self.push {
            let spec = ctx
                .process(self.dvc_bin.clone())
                .arg("push")
                .args(remote_args(self.remote.as_ref()));
            run_checked(&spec, &ctx.masker).context("Failed to push tracked data")?;
            info!(remote = ?self.remote, "Tracked data pushed");
        }

        Ok(json!({"tracked": tracked, "pushed": self.push}))
    }
}

struct GitPublishStage {
    git_bin: String,
    paths: Vec<String>,
    message: String,
    remote: String,
    branch: String,
    push: bool,
}

impl GitPublishStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let paths = take_string_list(&mut params, "paths")?;
        if paths.is_empty() {
            bail!("git-publish stage requires at least one entry in 'paths'");
        }
        let stage = Self {
            git_bin: take_string(&mut params, "git_bin").unwrap_or_else(|| "git".to_string()),
            paths,
            message: take_string(&mut params, "message")
                .unwrap_or_else(|| "Update tracked artifacts".to_string()),
            remote: take_string(&mut params, "remote").unwrap_or_else(|| "origin".to_string()),
            branch: take_string(&mut params, "branch").unwrap_or_else(|| "main".to_string()),
            push: take_bool(&mut params, "push")?.unwrap_or(false),
        };
        if stage.branch.trim().is_empty() {
            bail!("git-publish 'branch' must not be empty");
        }
        ensure_consumed("git-publish", &params)?;
        Ok(stage)
    }

    /// Pathspecs to stage. A DVC-tracked path is ignored by git, so its
    /// pointer file and the sibling `.gitignore` are staged instead.
    fn pathspecs(&self, ctx: &RunContext) -> Vec<String> {
        let mut specs = Vec::new();
        for path in &self.paths {
            let pointer = format!("{path}.dvc");
            if ctx.resolve_path(&pointer).is_file() {
                specs.push(pointer);
                let gitignore = Path::new(path)
                    .parent()
                    .map(|parent| parent.join(".gitignore"))
                    .unwrap_or_else(|| PathBuf::from(".gitignore"));
                if ctx.resolve_path(&gitignore).is_file() {
                    specs.push(gitignore.to_string_lossy().to_string());
                }
            } else if ctx.resolve_path(path).exists() {
                specs.push(path.clone());
            } else {
                warn!(path = path.as_str(), "Path to publish does not exist; skipping");
            }
        }
        specs.sort();
        specs.dedup();
        specs
    }
}

impl Stage for GitPublishStage {
    fn kind(&self) -> &'static str {
        "git-publish"
    }

    fn describe(&self) -> String {
        let mut plan = format!("{} add {} && commit", self.git_bin, self.paths.join(" "));
        if self.push {
            plan.push_str(&format!(" && push {} HEAD:{}", self.remote, self.branch));
        }
        plan
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let pathspecs = self.pathspecs(ctx);
        if pathspecs.is_empty() {
            bail!("None of the paths to publish exist: {}", self.paths.join(", "));
        }

        let add = ctx
            .process(self.git_bin.clone())
            .arg("add")
            .arg("--")
            .args(pathspecs.iter().cloned());
        run_checked(&add, &ctx.masker)?;

        // `git diff --cached --quiet` exits 1 when the index has staged changes.
        let diff = ctx
            .process(self.git_bin.clone())
            .args(["diff", "--cached", "--quiet"]);
        let output = run_process(&diff, &ctx.masker)?;
        let staged = match output.exit_code {
            Some(0) => false,
            Some(1) => true,
            _ => {
                output.into_result()?;
                false
            }
        };

        if staged {
            let commit = ctx
                .process(self.git_bin.clone())
                .args(["commit", "-m", self.message.as_str()]);
            run_checked(&commit, &ctx.masker)?;
            info!(message = self.message.as_str(), "Committed staged artifacts");
        } else {
            info!("Nothing to commit; index unchanged");
        }

        if self.push {
            let push = ctx.process(self.git_bin.clone()).args([
                "push".to_string(),
                self.remote.clone(),
                format!("HEAD:{}", self.branch),
            ]);
            run_checked(&push, &ctx.masker)?;
            info!(remote = self.remote.as_str(), branch = self.branch.as_str(), "Pushed");
        }

        Ok(json!({
            "staged": pathspecs,
            "committed": staged,
            "pushed": self.push,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IfMissing {
    Warn,
    Error,
    Ignore,
}

struct ArchiveStage {
    paths: Vec<String>,
    destination: PathBuf,
    name: String,
    format: ArchiveFormat,
    if_missing: IfMissing,
}

impl ArchiveStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let paths = take_string_list(&mut params, "paths")?;
        if paths.is_empty() {
            bail!("archive stage requires at least one entry in 'paths'");
        }
        let format = match take_string(&mut params, "format").as_deref() {
            None | Some("zip") => ArchiveFormat::Zip,
            Some("copy") => ArchiveFormat::Copy,
            Some(other) => bail!("Unsupported archive format '{other}'. Use zip or copy"),
        };
        let if_missing = match take_string(&mut params, "if_missing").as_deref() {
            None | Some("warn") => IfMissing::Warn,
            Some("error") => IfMissing::Error,
            Some("ignore") => IfMissing::Ignore,
            Some(other) => bail!("'if_missing' must be warn, error or ignore, got '{other}'"),
        };
        let stage = Self {
            paths,
            destination: take_string(&mut params, "destination")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("dist")),
            name: take_string(&mut params, "name").unwrap_or_else(|| "artifacts.zip".to_string()),
            format,
            if_missing,
        };
        ensure_consumed("archive", &params)?;
        Ok(stage)
    }
}

#[derive(Debug, Serialize)]
struct ArchivedFile {
    path: String,
    sha256: String,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct ArchiveManifest {
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    archive: Option<String>,
    files: Vec<ArchivedFile>,
    missing: Vec<String>,
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))? {
        let path = entry?;
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Name of `path` inside the archive: relative to the workdir when possible.
fn entry_name(workdir: &Path, path: &Path) -> String {
    let relative = path
        .strip_prefix(workdir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.file_name().map(PathBuf::from).unwrap_or_default());
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn normalized(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl ArchiveStage {
    /// Resolve `paths` into archive entry names, reporting the entries that
    /// matched nothing. Files under `exclude` are left out.
    fn collect(
        &self,
        ctx: &RunContext,
        exclude: Option<&Path>,
    ) -> Result<(BTreeMap<String, PathBuf>, Vec<String>)> {
        let workdir_pattern = glob::Pattern::escape(&ctx.workdir.to_string_lossy());
        let mut entries: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut missing = Vec::new();

        for raw in &self.paths {
            let files = if has_glob_meta(raw) {
                let pattern = if Path::new(raw).is_absolute() {
                    raw.clone()
                } else {
                    Path::new(&workdir_pattern)
                        .join(raw)
                        .to_string_lossy()
                        .to_string()
                };
                glob_files(&pattern)?
            } else {
                let path = ctx.resolve_path(raw);
                if path.is_dir() {
                    let escaped = glob::Pattern::escape(&path.to_string_lossy());
                    glob_files(&Path::new(&escaped).join("**").join("*").to_string_lossy())?
                } else if path.is_file() {
                    vec![path]
                } else {
                    Vec::new()
                }
            };

            if files.is_empty() {
                missing.push(raw.clone());
                continue;
            }
            for file in files {
                if exclude.is_some_and(|dir| normalized(&file).starts_with(dir)) {
                    continue;
                }
                let name = entry_name(&ctx.workdir, &file);
                if let Some(previous) = entries.get(&name)
                    && *previous != file
                {
                    bail!(
                        "Archive entry '{name}' would hold both {} and {}",
                        previous.display(),
                        file.display()
                    );
                }
                entries.insert(name, file);
            }
        }
        Ok((entries, missing))
    }
}

impl Stage for ArchiveStage {
    fn kind(&self) -> &'static str {
        "archive"
    }

    fn describe(&self) -> String {
        match self.format {
            ArchiveFormat::Zip => format!(
                "zip {} into {}",
                self.paths.join(", "),
                self.destination.join(&self.name).display()
            ),
            ArchiveFormat::Copy => format!(
                "copy {} into {}",
                self.paths.join(", "),
                self.destination.display()
            ),
        }
    }

    fn run(&self, ctx: &mut RunContext) -> Result<Value> {
        let destination = ctx.resolve_path(&self.destination);
        let exclude = match self.format {
            ArchiveFormat::Zip => None,
            ArchiveFormat::Copy => {
                let target = normalized(&destination);
                if normalized(&ctx.workdir).starts_with(&target) {
                    bail!(
                        "Copy destination {} contains the working directory",
                        destination.display()
                    );
                }
                for raw in self.paths.iter().filter(|raw| !has_glob_meta(raw)) {
                    let source = normalized(&ctx.resolve_path(raw));
                    if source == target {
                        bail!("Copy destination {} is the source '{raw}'", destination.display());
                    }
                }
                Some(target)
            }
        };
        let (mut entries, missing) = self.collect(ctx, exclude.as_deref())?;

        if !missing.is_empty() {
            match self.if_missing {
                IfMissing::Error => bail!("Nothing to archive for: {}", missing.join(", ")),
                IfMissing::Warn => warn!(missing = ?missing, "Some archive paths matched nothing"),
                IfMissing::Ignore => {}
            }
        }

        fs::create_dir_all(&destination).with_context(|| {
            format!("Failed to create archive destination: {}", destination.display())
        })?;
        let archive_path = destination.join(&self.name);
        let manifest_path = destination.join(ARCHIVE_MANIFEST_FILE);
        // Never archive our own outputs when the destination sits inside an archived directory.
        entries.retain(|_, path| *path != archive_path && *path != manifest_path);

        let mut files = Vec::with_capacity(entries.len());
        for (name, path) in &entries {
            files.push(ArchivedFile {
                path: name.clone(),
                sha256: compute_sha256(path)?,
                bytes: fs::metadata(path)
                    .with_context(|| format!("Failed to stat {}", path.display()))?
                    .len(),
            });
        }

        let archive = match self.format {
            ArchiveFormat::Zip => {
                write_zip(&archive_path, &entries)?;
                Some(archive_path.to_string_lossy().to_string())
            }
            ArchiveFormat::Copy => {
                for (name, path) in &entries {
                    let target = destination.join(name);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).with_context(|| {
                            format!("Failed to create directory: {}", parent.display())
                        })?;
                    }
                    fs::copy(path, &target)
                        .with_context(|| format!("Failed to copy {}", path.display()))?;
                }
                None
            }
        };

        let manifest = ArchiveManifest {
            format: match self.format {
                ArchiveFormat::Zip => "zip",
                ArchiveFormat::Copy => "copy",
            },
            archive,
            files,
            missing,
        };
        let file = File::create(&manifest_path)
            .with_context(|| format!("Failed to create manifest: {}", manifest_path.display()))?;
        serde_json::to_writer_pretty(file, &manifest)
            .with_context(|| format!("Failed to write manifest: {}", manifest_path.display()))?;
        info!(
            files = manifest.files.len(),
            destination = %destination.display(),
            "Artifacts archived"
        );

        Ok(json!({
            "archive": manifest.archive,
            "manifest": manifest_path.to_string_lossy(),
            "files": manifest.files.len(),
            "missing": manifest.missing,
        }))
    }
}

fn write_zip(path: &Path, entries: &BTreeMap<String, PathBuf>) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create archive: {}", path.display()))?;
    let mut zip = ZipWriter::new(file);
    for (name, source) in entries {
        zip.start_file::<_, ()>(name.as_str(), FileOptions::default())?;
        let mut input = File::open(source)
            .with_context(|| format!("Failed to open {}", source.display()))?;
        io::copy(&mut input, &mut zip)
            .with_context(|| format!("Failed to archive {}", source.display()))?;
    }
    zip.finish()?;
    Ok(())
}
