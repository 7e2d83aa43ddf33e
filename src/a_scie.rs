//! Resolution of the scie-jump and ptex helper binaries from their release
//! trees.
//!
//! Base URLs are overridable through the environment so air-gapped mirrors
//! (and tests) can stand in for the canonical release hosts.

use std::path::PathBuf;
use std::time::Duration;

use semver::Version;

use anyhow::Result;

use crate::fetch::{ExpectedDigest, Fetcher, Verified};
use crate::model::{File, FileSource, FileType, Ptex, ScieJump};
use crate::platform::Platform;

pub const JUMP_BASE_URL_ENV: &str = "SCIE_BUILDER_JUMP_BASE_URL";
pub const PTEX_BASE_URL_ENV: &str = "SCIE_BUILDER_PTEX_BASE_URL";

const DEFAULT_JUMP_BASE_URL: &str = "https://github.com/a-scie/jump/releases";
const DEFAULT_PTEX_BASE_URL: &str = "https://github.com/a-scie/ptex/releases";

/// Version-less release lookups go through the floating `latest` tag; cache
/// them for a few days rather than forever.
const UNPINNED_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// The release trees the helper binaries resolve from.
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    jump_base_url: String,
    ptex_base_url: String,
}

impl ReleaseSource {
    /// The canonical release hosts, honoring environment overrides.
    pub fn from_env() -> ReleaseSource {
        ReleaseSource {
            jump_base_url: std::env::var(JUMP_BASE_URL_ENV)
                .unwrap_or_else(|_| DEFAULT_JUMP_BASE_URL.to_string()),
            ptex_base_url: std::env::var(PTEX_BASE_URL_ENV)
                .unwrap_or_else(|_| DEFAULT_PTEX_BASE_URL.to_string()),
        }
    }

    pub fn with_base_urls(
        jump_base_url: impl Into<String>,
        ptex_base_url: impl Into<String>,
    ) -> ReleaseSource {
        ReleaseSource {
            jump_base_url: jump_base_url.into(),
            ptex_base_url: ptex_base_url.into(),
        }
    }

    /// Fetch and verify the scie-jump binary for `platform`.
    pub fn jump(
        &self,
        fetcher: &Fetcher,
        specification: &ScieJump,
        platform: Platform,
    ) -> Result<PathBuf> {
        let binary_name = platform.qualified_binary_name("scie-jump");
        let (url, ttl) = release_url(
            &self.jump_base_url,
            specification.version.as_ref(),
            &binary_name,
        );
        let expected = match &specification.digest {
            Some(digest) => ExpectedDigest::Digest(digest.clone()),
            None => ExpectedDigest::Sibling,
        };
        Ok(fetcher.fetch_and_verify(&url, expected, true, ttl)?.path)
    }

    /// Fetch and verify the ptex binary for `platform`, returning a
    /// digest-pinned file entry alongside the local path.
    pub fn ptex(
        &self,
        fetcher: &Fetcher,
        specification: Option<&Ptex>,
        platform: Platform,
    ) -> Result<(File, PathBuf)> {
        let id = specification
            .map(|ptex| ptex.id.clone())
            .unwrap_or_else(|| "ptex".to_string());
        let binary_name = platform.qualified_binary_name("ptex");
        let (url, ttl) = release_url(
            &self.ptex_base_url,
            specification.and_then(|ptex| ptex.version.as_ref()),
            &binary_name,
        );
        let expected = match specification.and_then(|ptex| ptex.digest.clone()) {
            Some(digest) => ExpectedDigest::Digest(digest),
            None => ExpectedDigest::Sibling,
        };
        let Verified { path, digest } = fetcher.fetch_and_verify(&url, expected, true, ttl)?;
        let file = File {
            name: binary_name,
            key: Some(id),
            digest: Some(digest),
            file_type: Some(FileType::Blob),
            executable: true,
            eager_extract: false,
            source: FileSource::Provided,
        };
        Ok((file, path))
    }
}

fn release_url(
    base_url: &str,
    version: Option<&Version>,
    binary_name: &str,
) -> (String, Option<Duration>) {
    match version {
        Some(version) => (format!("{base_url}/download/v{version}/{binary_name}"), None),
        None => (
            format!("{base_url}/latest/download/{binary_name}"),
            Some(UNPINNED_TTL),
        ),
    }
}
