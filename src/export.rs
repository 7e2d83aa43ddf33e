//! The export pipeline: stage every artifact an application needs for one
//! platform and emit the lift manifest the assembler consumes.
//!
//! Goals:
//! - one fresh staging directory per platform, never a half-written one
//! - locally supplied files are verified before they are linked in
//! - artifacts are symlinked from the cache, never copied

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::a_scie::ReleaseSource;
use crate::fetch::Fetcher;
use crate::lift::{self, BuildInfo, Manifest};
use crate::model::{Application, Command, Env, File, FileSource};
use crate::platform::Platform;

const DEFAULT_PTEX_ARGV1: &str = "{scie.lift}";

/// A `--file <id>=<path>` mapping naming where a provided file's content
/// lives on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub id: String,
    pub path: PathBuf,
}

impl FileMapping {
    pub fn parse(spec: &str) -> Result<FileMapping> {
        match spec.split_once('=') {
            Some((id, path)) if !id.is_empty() && !path.is_empty() => Ok(FileMapping {
                id: id.to_string(),
                path: PathBuf::from(path),
            }),
            _ => bail!(
                "Invalid file mapping '{spec}'. Expected the form <file id>=<local path>."
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub file_mappings: Vec<FileMapping>,
    pub dest_dir: PathBuf,
    pub force: bool,
    /// Overrides the application's platform set when present.
    pub platforms: Option<Vec<Platform>>,
    pub include_provenance: bool,
}

/// Stage the application for each requested platform and emit one lift
/// manifest per platform, returning the manifest paths in platform order.
pub fn export(
    app: &Application,
    fetcher: &Fetcher,
    releases: &ReleaseSource,
    options: &ExportOptions,
) -> Result<Vec<(Platform, PathBuf)>> {
    let platforms: Vec<Platform> = match &options.platforms {
        Some(platforms) => platforms.clone(),
        None => app.platforms.iter().copied().collect(),
    };

    fs::create_dir_all(&options.dest_dir).with_context(|| {
        format!(
            "Failed to create export destination {}",
            options.dest_dir.display()
        )
    })?;

    let mut manifests = Vec::with_capacity(platforms.len());
    for platform in platforms {
        let staging_dir = options.dest_dir.join(platform.as_str());
        prepare_staging_dir(&staging_dir, options.force)?;
        println!(
            "Exporting {} for {platform} to {}",
            app.name,
            staging_dir.display()
        );
        let manifest_path = export_platform(app, fetcher, releases, options, platform, &staging_dir)?;
        manifests.push((platform, manifest_path));
    }
    Ok(manifests)
}

fn prepare_staging_dir(staging_dir: &Path, force: bool) -> Result<()> {
    if staging_dir.exists() {
        if !force {
            bail!(
                "The export directory {} already exists. Use --force to replace it.",
                staging_dir.display()
            );
        }
        fs::remove_dir_all(staging_dir).with_context(|| {
            format!(
                "Failed to remove existing export directory {}",
                staging_dir.display()
            )
        })?;
    }
    fs::create_dir_all(staging_dir)
        .with_context(|| format!("Failed to create export directory {}", staging_dir.display()))?;
    Ok(())
}

fn export_platform(
    app: &Application,
    fetcher: &Fetcher,
    releases: &ReleaseSource,
    options: &ExportOptions,
    platform: Platform,
    staging_dir: &Path,
) -> Result<PathBuf> {
    // Interpreter distributions come first in the file list, in declaration
    // order, followed by the application's own files.
    let mut files: Vec<File> = Vec::with_capacity(app.files.len() + app.interpreters.len());
    let mut local_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut fetch_urls: BTreeMap<String, String> = BTreeMap::new();

    for interpreter in app.interpreters.values() {
        // An interpreter without a distribution for this platform simply
        // contributes nothing to it.
        let Some(distribution) = interpreter.provider.distribution(fetcher, platform)? else {
            continue;
        };
        match distribution.source {
            crate::providers::DistributionSource::Url(url) => {
                fetch_urls.insert(distribution.file.name.clone(), url);
            }
            crate::providers::DistributionSource::Path(path) => {
                local_paths.insert(distribution.file.name.clone(), path);
            }
        }
        files.push(distribution.file);
    }
    for file in &app.files {
        if let FileSource::Fetch(Some(url)) = &file.source {
            fetch_urls.insert(file.name.clone(), url.clone());
        }
    }
    files.extend(app.files.iter().cloned());

    // Lazy distributions land as runtime-fetched files above, so the file
    // list alone decides whether fetch support is needed on this platform.
    let needs_fetch = files
        .iter()
        .any(|file| matches!(file.source, FileSource::Fetch(_)));

    let mut bindings: Vec<Command> = Vec::with_capacity(app.bindings.len() + 1);
    if needs_fetch {
        let (ptex_file, ptex_path) = releases.ptex(fetcher, app.ptex.as_ref(), platform)?;
        let argv1 = app
            .ptex
            .as_ref()
            .map(|ptex| ptex.argv1.clone())
            .unwrap_or_else(|| DEFAULT_PTEX_ARGV1.to_string());
        bindings.push(Command {
            name: Some("fetch".to_string()),
            description: None,
            exe: ptex_file.placeholder(),
            args: vec![argv1],
            env: Env::default(),
        });
        local_paths.insert(ptex_file.name.clone(), ptex_path);
        files.insert(0, ptex_file);
    }
    bindings.extend(app.bindings.iter().cloned());

    for file in &files {
        match &file.source {
            FileSource::Fetch(_) | FileSource::Binding(_) => continue,
            FileSource::Provided => {}
        }
        let local_path = match local_paths.get(&file.name) {
            // Already fetched and verified through the cache.
            Some(path) => path.clone(),
            None => resolve_provided_file(file, &options.file_mappings)?,
        };
        let link_path = staging_dir.join(&file.name);
        symlink_file(&local_path, &link_path)?;
    }

    let manifest_path = staging_dir.join("lift.json");
    let mut out = fs::File::create(&manifest_path)
        .with_context(|| format!("Failed to create {}", manifest_path.display()))?;
    lift::emit_manifest(
        &mut out,
        &Manifest {
            name: &app.name,
            description: app.description.as_deref(),
            load_dotenv: app.load_dotenv,
            scie_jump: &app.scie_jump,
            platform,
            interpreter_groups: &app.interpreter_groups,
            files: &files,
            commands: &app.commands,
            bindings: &bindings,
            fetch_urls: &fetch_urls,
            build_info: options.include_provenance.then(provenance),
        },
    )?;
    Ok(manifest_path)
}

/// Locate a provided file's local content through the `--file` mappings,
/// falling back to the working directory, and verify it before it is used.
fn resolve_provided_file(file: &File, mappings: &[FileMapping]) -> Result<PathBuf> {
    let path = mappings
        .iter()
        .find(|mapping| mapping.id == file.id())
        .map(|mapping| mapping.path.clone())
        .unwrap_or_else(|| PathBuf::from(&file.name));
    if !path.exists() {
        bail!(
            "The file '{}' is not found at {}. Use --file {}=<local path> to point at its \
             content.",
            file.id(),
            path.display(),
            file.id()
        );
    }
    file.check_digest(&path)?;
    Ok(path)
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> Result<()> {
    let target = target
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", target.display()))?;
    std::os::unix::fs::symlink(&target, link).with_context(|| {
        format!(
            "Failed to link {} into the export directory at {}",
            target.display(),
            link.display()
        )
    })
}

#[cfg(not(unix))]
fn symlink_file(target: &Path, link: &Path) -> Result<()> {
    // Symlink creation needs elevated rights on some Windows setups; fall
    // back to a copy.
    if std::os::windows::fs::symlink_file(target, link).is_ok() {
        return Ok(());
    }
    fs::copy(target, link).map(|_| ()).with_context(|| {
        format!(
            "Failed to place {} into the export directory at {}",
            target.display(),
            link.display()
        )
    })
}

fn provenance() -> BuildInfo {
    let version = env!("CARGO_PKG_VERSION");
    BuildInfo {
        note: format!("Generated by scie-builder {version}."),
        version: version.to_string(),
        binary_url: format!("https://crates.io/crates/scie-builder/{version}"),
    }
}
