//! Artifact fetching through the download cache, with fingerprint
//! verification.
//!
//! Every byte that enters the cache flows through here: payloads stream
//! through a sha256 digest while being written to the cache's work file and
//! a mismatch aborts the write before anything is published.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest as _, Sha256};

use crate::cache::{CacheResult, DownloadCache};
use crate::hashing::sha256_file;
use crate::model::Digest;

/// Bearer token honored on every request, for authenticated release fetches.
pub const API_BEARER_TOKEN_ENV: &str = "SCIE_BUILDER_GITHUB_API_BEARER_TOKEN";

const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the expected fingerprint for a download comes from.
///
/// Explicit configuration always wins; the checksum-locator fallbacks are
/// only consulted when no digest was configured.
#[derive(Debug, Clone)]
pub enum ExpectedDigest {
    /// A digest pinned in configuration; both size and fingerprint are
    /// enforced.
    Digest(Digest),
    /// Fetch the fingerprint from this checksum document.
    ChecksumUrl(String),
    /// Fetch the conventional `<artifact-url>.sha256` sibling.
    Sibling,
}

/// A fetched artifact together with its verified digest.
#[derive(Debug, Clone)]
pub struct Verified {
    pub path: PathBuf,
    pub digest: Digest,
}

/// An HTTP client bound to a download cache.
pub struct Fetcher {
    cache: DownloadCache,
    agent: ureq::Agent,
    bearer_token: Option<String>,
}

impl Fetcher {
    pub fn new(cache: DownloadCache) -> Fetcher {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .build();
        Fetcher {
            cache,
            agent: ureq::Agent::new_with_config(config),
            bearer_token: std::env::var(API_BEARER_TOKEN_ENV).ok(),
        }
    }

    fn get(&self, url: &str) -> Result<ureq::Body> {
        let mut request = self.agent.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.header("Authorization", &format!("Bearer {token}"));
        }
        let response = request
            .call()
            .map_err(|err| anyhow!("Failed to fetch {url}: {err}"))?;
        Ok(response.into_body())
    }

    /// Download `url` into the cache without verification.
    pub fn fetch_to_cache(&self, url: &str, ttl: Option<Duration>) -> Result<PathBuf> {
        match self.cache.acquire(url, ttl)? {
            CacheResult::Hit(path) => Ok(path),
            CacheResult::Miss(work) => {
                let mut reader = self.get(url)?.into_reader();
                let mut out = work.open()?;
                std::io::copy(&mut reader, &mut out)
                    .with_context(|| format!("Failed to stream {url} to the download cache"))?;
                drop(out);
                work.commit()
            }
        }
    }

    /// Download `url` into the cache and return its text body.
    pub fn fetch_text(&self, url: &str, ttl: Option<Duration>) -> Result<String> {
        let path = self.fetch_to_cache(url, ttl)?;
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cached copy of {url}"))
    }

    /// Download `url` into the cache, verifying its content against the
    /// expected fingerprint while streaming.
    ///
    /// On a mismatch the cache write is aborted and no entry is published;
    /// a subsequent acquire for the same locator sees a miss, not a
    /// poisoned hit. On success the executable bit is applied (Unix) before
    /// the payload is atomically published.
    pub fn fetch_and_verify(
        &self,
        url: &str,
        expected: ExpectedDigest,
        executable: bool,
        ttl: Option<Duration>,
    ) -> Result<Verified> {
        let work = match self.cache.acquire(url, ttl)? {
            CacheResult::Hit(path) => {
                let (fingerprint, size) = sha256_file(&path)?;
                if let ExpectedDigest::Digest(digest) = &expected {
                    // A cached payload may predate a configuration change;
                    // re-check it against the pinned digest.
                    digest.check_computed(&path, size, &fingerprint)?;
                }
                return Ok(Verified {
                    path,
                    digest: Digest { size, fingerprint },
                });
            }
            CacheResult::Miss(work) => work,
        };

        println!("Downloading {url} ...");
        let (expected_size, expected_fingerprint) = match expected {
            ExpectedDigest::Digest(digest) => (Some(digest.size), digest.fingerprint),
            ExpectedDigest::ChecksumUrl(checksum_url) => {
                (None, self.fetch_fingerprint(&checksum_url)?)
            }
            ExpectedDigest::Sibling => (None, self.fetch_fingerprint(&format!("{url}.sha256"))?),
        };

        let mut reader = self.get(url)?.into_reader();
        let mut out = work.open()?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .with_context(|| format!("Failed to stream {url}"))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .with_context(|| format!("Failed to write cache work file for {url}"))?;
            size += n as u64;
        }
        drop(out);

        let actual_fingerprint = format!("{:x}", hasher.finalize());
        if actual_fingerprint != expected_fingerprint {
            bail!(
                "The download from {url} had unexpected contents.\n\
                 Expected sha256 digest:\n  {expected_fingerprint}\n\
                 Actual sha256 digest:\n  {actual_fingerprint}"
            );
        }
        if let Some(expected_size) = expected_size {
            if expected_size != size {
                bail!(
                    "The download from {url} was {size} bytes but {expected_size} bytes were \
                     expected."
                );
            }
        }

        #[cfg(unix)]
        if executable {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(work.path(), std::fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to mark {} executable", work.path().display()))?;
        }
        #[cfg(not(unix))]
        let _ = executable;

        let path = work.commit()?;
        Ok(Verified {
            path,
            digest: Digest {
                size,
                fingerprint: actual_fingerprint,
            },
        })
    }

    /// Fetch a checksum document and extract the fingerprint from it.
    fn fetch_fingerprint(&self, url: &str) -> Result<String> {
        let text = self
            .get(url)?
            .read_to_string()
            .with_context(|| format!("Failed to read checksum document at {url}"))?;
        parse_checksum_text(&text)
            .ok_or_else(|| anyhow!("The checksum document at {url} was empty."))
    }
}

/// A checksum document's fingerprint is its first whitespace-delimited
/// token, which tolerates both bare digests and `<digest> *<name>` lines.
fn parse_checksum_text(text: &str) -> Option<String> {
    text.split_whitespace().next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubServer;
    use sha2::{Digest as _, Sha256};
    use tempfile::TempDir;

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn fetcher() -> (TempDir, Fetcher) {
        let tmp = TempDir::new().unwrap();
        let cache = DownloadCache::new(tmp.path().join("cache")).unwrap();
        (tmp, Fetcher::new(cache))
    }

    #[test]
    fn checksum_parsing_takes_first_token() {
        assert_eq!(
            Some("abc123".to_string()),
            parse_checksum_text("abc123 *tool-linux-x86_64\n")
        );
        assert_eq!(Some("abc123".to_string()), parse_checksum_text("  abc123\n"));
        assert_eq!(None, parse_checksum_text("  \n"));
    }

    #[test]
    fn fetch_to_cache_downloads_at_most_once() {
        let server = StubServer::serve(vec![("/tool.bin".to_string(), b"bytes".to_vec())]);
        let (_tmp, fetcher) = fetcher();
        let url = server.url("/tool.bin");

        let first = fetcher.fetch_to_cache(&url, None).unwrap();
        let second = fetcher.fetch_to_cache(&url, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(b"bytes".to_vec(), std::fs::read(&first).unwrap());
        assert_eq!(1, server.request_count());
    }

    #[test]
    fn verify_against_sibling_checksum() {
        let payload = b"interpreter distribution".to_vec();
        let checksum = format!("{} *tool.bin\n", sha256_hex(&payload));
        let server = StubServer::serve(vec![
            ("/tool.bin".to_string(), payload.clone()),
            ("/tool.bin.sha256".to_string(), checksum.into_bytes()),
        ]);
        let (_tmp, fetcher) = fetcher();

        let verified = fetcher
            .fetch_and_verify(&server.url("/tool.bin"), ExpectedDigest::Sibling, false, None)
            .unwrap();
        assert_eq!(payload.len() as u64, verified.digest.size);
        assert_eq!(sha256_hex(&payload), verified.digest.fingerprint);
        assert_eq!(payload, std::fs::read(&verified.path).unwrap());
    }

    #[test]
    fn verify_mismatch_publishes_nothing() {
        let server = StubServer::serve(vec![("/tool.bin".to_string(), b"actual bytes".to_vec())]);
        let (_tmp, fetcher) = fetcher();
        let url = server.url("/tool.bin");

        let wrong = Digest {
            size: 12,
            fingerprint: "0".repeat(64),
        };
        let err = fetcher
            .fetch_and_verify(&url, ExpectedDigest::Digest(wrong.clone()), false, None)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unexpected contents"), "{message}");
        assert!(message.contains(&wrong.fingerprint), "{message}");
        assert!(message.contains(&sha256_hex(b"actual bytes")), "{message}");

        // The aborted write must not have poisoned the cache: the next
        // fetch re-downloads rather than hitting a corrupt entry.
        let right = Digest {
            size: 12,
            fingerprint: sha256_hex(b"actual bytes"),
        };
        fetcher
            .fetch_and_verify(&url, ExpectedDigest::Digest(right), false, None)
            .unwrap();
        assert_eq!(2, server.request_count());
    }

    #[test]
    fn cached_hit_is_rechecked_against_a_pinned_digest() {
        let payload = b"cached payload".to_vec();
        let server = StubServer::serve(vec![
            ("/tool.bin".to_string(), payload.clone()),
            (
                "/tool.bin.sha256".to_string(),
                sha256_hex(&payload).into_bytes(),
            ),
        ]);
        let (_tmp, fetcher) = fetcher();
        let url = server.url("/tool.bin");

        fetcher
            .fetch_and_verify(&url, ExpectedDigest::Sibling, false, None)
            .unwrap();
        let downloads = server.request_count();

        // A pinned digest that no longer matches the cached payload fails
        // on the hit path, without touching the network again.
        let stale_pin = Digest {
            size: payload.len() as u64,
            fingerprint: "0".repeat(64),
        };
        let err = fetcher
            .fetch_and_verify(&url, ExpectedDigest::Digest(stale_pin), false, None)
            .unwrap_err();
        assert!(err.to_string().contains("unexpected contents"), "{err}");
        assert_eq!(downloads, server.request_count());

        let good_pin = Digest {
            size: payload.len() as u64,
            fingerprint: sha256_hex(&payload),
        };
        let verified = fetcher
            .fetch_and_verify(&url, ExpectedDigest::Digest(good_pin), false, None)
            .unwrap();
        assert_eq!(sha256_hex(&payload), verified.digest.fingerprint);
        assert_eq!(downloads, server.request_count());
    }

    #[test]
    fn explicit_digest_takes_precedence_over_checksum_urls() {
        // No checksum document is served; an explicit digest must not
        // consult one.
        let payload = b"pinned".to_vec();
        let server = StubServer::serve(vec![("/tool.bin".to_string(), payload.clone())]);
        let (_tmp, fetcher) = fetcher();

        let digest = Digest {
            size: payload.len() as u64,
            fingerprint: sha256_hex(&payload),
        };
        fetcher
            .fetch_and_verify(
                &server.url("/tool.bin"),
                ExpectedDigest::Digest(digest),
                false,
                None,
            )
            .unwrap();
        assert_eq!(1, server.request_count());
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_applied_before_publish() {
        use std::os::unix::fs::PermissionsExt;

        let payload = b"#!/bin/sh\n".to_vec();
        let checksum = sha256_hex(&payload);
        let server = StubServer::serve(vec![
            ("/run.sh".to_string(), payload),
            ("/run.sh.sha256".to_string(), checksum.into_bytes()),
        ]);
        let (_tmp, fetcher) = fetcher();

        let verified = fetcher
            .fetch_and_verify(&server.url("/run.sh"), ExpectedDigest::Sibling, true, None)
            .unwrap();
        let mode = std::fs::metadata(&verified.path).unwrap().permissions().mode();
        assert_eq!(0o755, mode & 0o777);
    }
}
