use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use scie_builder::a_scie::ReleaseSource;
use scie_builder::build::{self, BuildOptions, HashAlgorithm};
use scie_builder::cache::DownloadCache;
use scie_builder::config;
use scie_builder::export::{self, ExportOptions, FileMapping};
use scie_builder::fetch::Fetcher;
use scie_builder::providers::ProviderRegistry;

#[derive(Parser)]
#[command(name = "scie-builder", version, about = "Build self-contained scie executables from declarative lift configurations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export the per-platform staging directories and lift manifests.
    Export(ExportArgs),
    /// Build the final scie executables.
    Build(BuildArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// The lift configuration to resolve.
    config: PathBuf,

    /// Where to place the results.
    #[arg(long, default_value = ".", env = "SCIE_BUILDER_DEST_DIR")]
    dest_dir: PathBuf,

    /// Record builder provenance in the emitted manifests.
    #[arg(long)]
    include_provenance: bool,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Where local content for a provided file lives, as <file id>=<path>.
    #[arg(long = "file", value_name = "ID=PATH", env = "SCIE_BUILDER_EXPORT_FILE")]
    files: Vec<String>,

    /// Replace existing per-platform export directories.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct BuildArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Where local content for a provided file lives, as <file id>=<path>.
    #[arg(long = "file", value_name = "ID=PATH", env = "SCIE_BUILDER_BUILD_FILE")]
    files: Vec<String>,

    /// Keep the export sandbox around for inspection.
    #[arg(long)]
    preserve_sandbox: bool,

    /// Assemble with this local scie-jump binary instead of a fetched
    /// release. Restricts the build to the current platform.
    #[arg(long, value_name = "PATH")]
    use_jump: Option<PathBuf>,

    /// Write a checksum sidecar per built binary with this algorithm.
    #[arg(long = "hash", value_name = "ALGORITHM", env = "SCIE_BUILDER_BUILD_HASH")]
    hash_algorithms: Vec<HashAlgorithm>,

    /// Qualify output names with the target platform.
    #[arg(long)]
    use_platform_suffix: bool,
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let registry = ProviderRegistry::with_builtins();
    let cache = DownloadCache::open_default()?;
    let fetcher = Fetcher::new(cache);
    let releases = ReleaseSource::from_env();

    match cli.command {
        Commands::Export(args) => {
            let app = config::parse_config_file(&args.common.config, &registry)?;
            let manifests = export::export(
                &app,
                &fetcher,
                &releases,
                &ExportOptions {
                    file_mappings: parse_file_mappings(&args.files)?,
                    dest_dir: args.common.dest_dir,
                    force: args.force,
                    platforms: None,
                    include_provenance: args.common.include_provenance,
                },
            )?;
            for (_, manifest_path) in manifests {
                println!("{}", manifest_path.display());
            }
        }
        Commands::Build(args) => {
            let app = config::parse_config_file(&args.common.config, &registry)?;
            let built = build::build(
                &app,
                &fetcher,
                &releases,
                &BuildOptions {
                    file_mappings: parse_file_mappings(&args.files)?,
                    dest_dir: args.common.dest_dir,
                    preserve_sandbox: args.preserve_sandbox,
                    use_jump: args.use_jump,
                    hash_algorithms: args.hash_algorithms,
                    use_platform_suffix: args.use_platform_suffix,
                    include_provenance: args.common.include_provenance,
                },
            )?;
            for path in built {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

fn parse_file_mappings(specs: &[String]) -> Result<Vec<FileMapping>> {
    specs.iter().map(|spec| FileMapping::parse(spec)).collect()
}
