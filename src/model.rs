//! The immutable domain model a lift configuration resolves into.
//!
//! Everything here is a value type: the config resolver builds an
//! [`Application`] once per invocation and nothing mutates it afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use semver::Version;

use crate::hashing::sha256_file;
use crate::platform::Platform;
use crate::providers::Provider;

/// A pinned artifact size and sha256 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub size: u64,
    pub fingerprint: String,
}

impl Digest {
    /// Verify a local file against this digest, size first.
    pub fn check(&self, path: &Path) -> Result<()> {
        let (fingerprint, size) = sha256_file(path)?;
        self.check_computed(path, size, &fingerprint)
    }

    /// Verify an already-computed size and fingerprint for the file at
    /// `path`, so callers that hashed the content once need not stream it
    /// again.
    pub fn check_computed(&self, path: &Path, size: u64, fingerprint: &str) -> Result<()> {
        if size != self.size {
            bail!(
                "The file at {} is {size} bytes but {} bytes were expected.",
                path.display(),
                self.size
            );
        }
        if fingerprint != self.fingerprint {
            bail!(
                "The file at {} had unexpected contents.\n\
                 Expected sha256 digest:\n  {}\n\
                 Actual sha256 digest:\n  {fingerprint}",
                path.display(),
                self.fingerprint
            );
        }
        Ok(())
    }
}

/// How the assembler should treat a file's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Blob,
    Directory,
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    TarZst,
}

impl FileType {
    pub fn parse(value: &str) -> Result<FileType> {
        match value {
            "blob" => Ok(FileType::Blob),
            "directory" => Ok(FileType::Directory),
            "zip" => Ok(FileType::Zip),
            "tar" => Ok(FileType::Tar),
            "tar.gz" => Ok(FileType::TarGz),
            "tar.bz2" => Ok(FileType::TarBz2),
            "tar.xz" => Ok(FileType::TarXz),
            "tar.zst" => Ok(FileType::TarZst),
            other => bail!(
                "Unknown file type '{other}'. Known types are: blob, directory, zip, tar, \
                 tar.gz, tar.bz2, tar.xz, tar.zst"
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Blob => "blob",
            FileType::Directory => "directory",
            FileType::Zip => "zip",
            FileType::Tar => "tar",
            FileType::TarGz => "tar.gz",
            FileType::TarBz2 => "tar.bz2",
            FileType::TarXz => "tar.xz",
            FileType::TarZst => "tar.zst",
        }
    }
}

/// Where a file's bytes come from at export or runtime.
///
/// Consumers match exhaustively: a file is either supplied locally when
/// exporting, fetched by the built scie at runtime, or produced by a named
/// binding command the first time the scie runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Supplied at export time via a `--file` mapping or the working directory.
    Provided,
    /// Fetched at runtime by the scie's fetch binding, from the declared
    /// locator when one was configured.
    Fetch(Option<String>),
    /// Produced by the binding command with this name.
    Binding(String),
}

/// A file bundled into (or fetched by) the built scie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub key: Option<String>,
    pub digest: Option<Digest>,
    pub file_type: Option<FileType>,
    pub executable: bool,
    pub eager_extract: bool,
    pub source: FileSource,
}

impl File {
    /// The identifier used in `--file` mappings and command placeholders.
    pub fn id(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }

    /// The assembler placeholder that expands to this file's path at runtime.
    pub fn placeholder(&self) -> String {
        format!("{{{}}}", self.id())
    }

    /// Verify the on-disk content when a digest was declared.
    pub fn check_digest(&self, path: &Path) -> Result<()> {
        match &self.digest {
            Some(digest) => digest.check(path),
            None => Ok(()),
        }
    }
}

/// Environment manipulation applied before a command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    pub default: BTreeMap<String, String>,
    pub replace: BTreeMap<String, String>,
    pub remove_exact: BTreeSet<String>,
    pub remove_re: BTreeSet<String>,
}

impl Env {
    pub fn is_empty(&self) -> bool {
        self.default.is_empty()
            && self.replace.is_empty()
            && self.remove_exact.is_empty()
            && self.remove_re.is_empty()
    }
}

/// A command or binding the built scie can execute.
///
/// An unnamed command is the scie's default entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: Option<String>,
    pub description: Option<String>,
    pub exe: String,
    pub args: Vec<String>,
    pub env: Env,
}

/// The scie-jump launcher specification: both fields optional, unpinned by
/// default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScieJump {
    pub version: Option<Version>,
    pub digest: Option<Digest>,
}

/// The ptex fetch-helper specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ptex {
    pub id: String,
    pub argv1: String,
    pub version: Option<Version>,
    pub digest: Option<Digest>,
}

/// An interpreter distribution request, resolved per platform through its
/// provider when exporting.
#[derive(Debug)]
pub struct Interpreter {
    pub id: String,
    pub lazy: bool,
    pub provider: Box<dyn Provider>,
}

// Provider capabilities carry no comparable state of their own; two
// interpreters are structurally equal when their declaration matches.
impl PartialEq for Interpreter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.lazy == other.lazy
    }
}

impl Eq for Interpreter {}

/// A runtime-selectable group of at least two interpreters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterGroup {
    pub id: String,
    pub selector: String,
    pub members: Vec<String>,
}

/// A fully resolved lift application.
#[derive(Debug, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub description: Option<String>,
    pub load_dotenv: bool,
    pub platforms: BTreeSet<Platform>,
    pub scie_jump: ScieJump,
    pub ptex: Option<Ptex>,
    pub interpreters: IndexMap<String, Interpreter>,
    pub interpreter_groups: Vec<InterpreterGroup>,
    pub files: Vec<File>,
    pub commands: Vec<Command>,
    pub bindings: Vec<Command>,
}
