//! The build orchestrator: export into a sandbox, run the scie-jump
//! assembler over each manifest, and land the finished binaries.

use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use semver::Version;
use sha2::{Digest as _, Sha256, Sha512};
use tempfile::TempDir;

use crate::a_scie::ReleaseSource;
use crate::export::{self, ExportOptions, FileMapping};
use crate::fetch::Fetcher;
use crate::model::Application;
use crate::platform::Platform;

/// Assembling for another platform rides on scie-jump's `-sj` support,
/// which older releases lack.
const MIN_ASSEMBLY_VERSION: Version = Version::new(0, 9, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub file_mappings: Vec<FileMapping>,
    pub dest_dir: PathBuf,
    pub preserve_sandbox: bool,
    /// A local scie-jump binary to assemble with instead of a fetched
    /// release. Restricts the build to the current platform.
    pub use_jump: Option<PathBuf>,
    pub hash_algorithms: Vec<HashAlgorithm>,
    pub use_platform_suffix: bool,
    pub include_provenance: bool,
}

/// Build one scie executable per requested platform, returning the final
/// binary paths in platform order.
pub fn build(
    app: &Application,
    fetcher: &Fetcher,
    releases: &ReleaseSource,
    options: &BuildOptions,
) -> Result<Vec<PathBuf>> {
    if let Some(version) = &app.scie_jump.version {
        if *version < MIN_ASSEMBLY_VERSION {
            bail!(
                "Cannot build with scie-jump {version}: assembling scies requires \
                 {MIN_ASSEMBLY_VERSION} or newer."
            );
        }
    }

    let current = Platform::current()?;
    let (platforms, use_suffix) = resolve_platforms(
        app.platforms.iter().copied().collect(),
        current,
        options.use_platform_suffix,
        options.use_jump.is_some(),
    );

    // The export is staged in a throwaway sandbox so a failed assembly
    // leaves nothing behind in the destination.
    let sandbox = TempDir::new().context("Failed to create a build sandbox")?;
    let mut sandbox_guard = None;
    let sandbox_dir = if options.preserve_sandbox {
        let path = sandbox.into_path();
        println!("Preserving the build sandbox at {}", path.display());
        path
    } else {
        let path = sandbox.path().to_path_buf();
        sandbox_guard = Some(sandbox);
        path
    };

    let manifests = export::export(
        app,
        fetcher,
        releases,
        &ExportOptions {
            file_mappings: options.file_mappings.clone(),
            dest_dir: sandbox_dir,
            force: false,
            platforms: Some(platforms),
            include_provenance: options.include_provenance,
        },
    )?;

    let native_jump = match &options.use_jump {
        Some(path) => path.clone(),
        None => releases.jump(fetcher, &app.scie_jump, current)?,
    };

    fs::create_dir_all(&options.dest_dir).with_context(|| {
        format!(
            "Failed to create build destination {}",
            options.dest_dir.display()
        )
    })?;

    let mut built = Vec::with_capacity(manifests.len());
    for (platform, manifest_path) in manifests {
        let platform_jump = match &options.use_jump {
            Some(path) => path.clone(),
            None => releases.jump(fetcher, &app.scie_jump, platform)?,
        };
        let manifest_dir = manifest_path
            .parent()
            .with_context(|| format!("The manifest at {} has no parent", manifest_path.display()))?;
        assemble(&native_jump, &platform_jump, manifest_dir)?;

        // The native jump doing the assembly names its output by the host
        // platform's convention; only the final rename is target-named.
        let assembled = manifest_dir.join(current.binary_name(&app.name));
        if !assembled.exists() {
            bail!(
                "The assembler reported success but produced no binary at {}.",
                assembled.display()
            );
        }
        let final_name = if use_suffix {
            platform.qualified_binary_name(&app.name)
        } else {
            platform.binary_name(&app.name)
        };
        let dest = options.dest_dir.join(&final_name);
        move_file(&assembled, &dest)?;

        for algorithm in &options.hash_algorithms {
            write_checksum_sidecar(*algorithm, &dest, &final_name)?;
        }
        built.push(dest);
    }
    drop(sandbox_guard);
    Ok(built)
}

/// Decide which platforms to build and whether the output names carry a
/// platform suffix. A suffix is forced for multi-platform or cross-platform
/// builds; a local jump binary cannot cross-build, so it wins the conflict
/// and narrows the build to the current platform.
fn resolve_platforms(
    requested: Vec<Platform>,
    current: Platform,
    use_platform_suffix: bool,
    use_local_jump: bool,
) -> (Vec<Platform>, bool) {
    let use_suffix =
        use_platform_suffix || requested.len() > 1 || requested.first() != Some(&current);
    if use_local_jump && use_suffix {
        eprintln!(
            "Warning: a local scie-jump binary can only assemble for the current platform; \
             building for {current} only, without a platform suffix."
        );
        return (vec![current], false);
    }
    (requested, use_suffix)
}

/// Run `<native-jump> -sj <platform-jump> lift.json` in the manifest's
/// directory. The assembler chatters on stdout; only its exit code matters.
fn assemble(native_jump: &Path, platform_jump: &Path, manifest_dir: &Path) -> Result<()> {
    let status = Command::new(native_jump)
        .arg("-sj")
        .arg(platform_jump)
        .arg("lift.json")
        .current_dir(manifest_dir)
        .stdout(Stdio::null())
        .status()
        .with_context(|| format!("Failed to run the assembler at {}", native_jump.display()))?;
    if !status.success() {
        bail!(
            "The scie assembly in {} failed: {status}.",
            manifest_dir.display()
        );
    }
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems; fall back to copy and remove.
    fs::copy(from, to)
        .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))?;
    fs::remove_file(from)
        .with_context(|| format!("Failed to remove {} after copying", from.display()))?;
    Ok(())
}

fn write_checksum_sidecar(algorithm: HashAlgorithm, binary: &Path, name: &str) -> Result<()> {
    let hex = checksum(algorithm, binary)?;
    let sidecar = binary.with_file_name(format!("{name}.{}", algorithm.as_str()));
    let mut out = fs::File::create(&sidecar)
        .with_context(|| format!("Failed to create {}", sidecar.display()))?;
    writeln!(out, "{hex} *{name}")
        .with_context(|| format!("Failed to write {}", sidecar.display()))?;
    Ok(())
}

fn checksum(algorithm: HashAlgorithm, path: &Path) -> Result<String> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let hex = match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            std::io::copy(&mut reader, &mut hasher)
                .with_context(|| format!("Failed to hash {}", path.display()))?;
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            std::io::copy(&mut reader, &mut hasher)
                .with_context(|| format!("Failed to hash {}", path.display()))?;
            format!("{:x}", hasher.finalize())
        }
    };
    Ok(hex)
}
