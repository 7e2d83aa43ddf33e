//! The built-in `url` provider: distributions declared directly in the
//! configuration as per-platform locators.
//!
//! ```toml
//! [[lift.interpreters]]
//! id = "cpython"
//! provider = "url"
//! lazy = true
//!
//! [lift.interpreters.distributions."linux-x86_64"]
//! url = "https://example.org/cpython-3.12-linux-x86_64.tar.gz"
//! size = 31415926
//! fingerprint = "..."
//! type = "tar.gz"
//! ```

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::fetch::{ExpectedDigest, Fetcher};
use crate::model::{Digest, File, FileSource, FileType};
use crate::platform::Platform;
use crate::providers::{Distribution, DistributionSource, Provider, ProviderContext};

#[derive(Debug, Clone)]
struct DeclaredDistribution {
    url: String,
    file_name: String,
    digest: Option<Digest>,
    file_type: Option<FileType>,
    eager_extract: bool,
}

#[derive(Debug)]
struct UrlProvider {
    id: String,
    lazy: bool,
    distributions: BTreeMap<Platform, DeclaredDistribution>,
}

pub(crate) fn create(context: &ProviderContext) -> Result<Box<dyn Provider>> {
    let mut distributions = BTreeMap::new();
    if let Some(table) = context.config.get_data_opt("distributions")? {
        let platform_names: Vec<String> = table.keys().map(str::to_string).collect();
        for platform_name in platform_names {
            let platform = Platform::parse(&platform_name)?;
            let entry = table.get_data(&platform_name)?;
            let url = entry.get_str("url")?;

            let digest = match (entry.contains("size"), entry.contains("fingerprint")) {
                (true, true) => Some(Digest {
                    size: non_negative_size(&entry)?,
                    fingerprint: entry.get_str("fingerprint")?,
                }),
                (false, false) => None,
                _ => bail!(
                    "Expected {} defined in {} to declare both `size` and `fingerprint` or \
                     neither.",
                    entry.describe("url"),
                    entry.source()
                ),
            };
            if context.lazy && digest.is_none() {
                bail!(
                    "Interpreter '{}' is lazy, so its distribution for {platform} must pin \
                     `size` and `fingerprint`: the runtime fetch cannot verify the download \
                     without them.",
                    context.id
                );
            }

            let file_type = match entry.get_str_or("type", "")? {
                value if value.is_empty() => None,
                value => Some(FileType::parse(&value)?),
            };
            let file_name = match entry.get_str_or("name", "")? {
                value if value.is_empty() => url_basename(&url, &context.id),
                value => value,
            };
            distributions.insert(
                platform,
                DeclaredDistribution {
                    url,
                    file_name,
                    digest,
                    file_type,
                    eager_extract: entry.get_bool_or("eager_extract", false)?,
                },
            );
        }
    }
    Ok(Box::new(UrlProvider {
        id: context.id.clone(),
        lazy: context.lazy,
        distributions,
    }))
}

fn non_negative_size(entry: &crate::config::data::Data) -> Result<u64> {
    let size = entry.get_int("size")?;
    u64::try_from(size).map_err(|_| {
        anyhow::anyhow!(
            "Expected a non-negative size for {} in {} but found {size}.",
            entry.describe("size"),
            entry.source()
        )
    })
}

fn url_basename(url: &str, fallback: &str) -> String {
    url.split('?')
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .filter(|tail| !tail.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

impl Provider for UrlProvider {
    fn distribution(&self, fetcher: &Fetcher, platform: Platform) -> Result<Option<Distribution>> {
        let Some(declared) = self.distributions.get(&platform) else {
            return Ok(None);
        };

        if self.lazy {
            // The declared digest is guaranteed by construction.
            let file = File {
                name: declared.file_name.clone(),
                key: Some(self.id.clone()),
                digest: declared.digest.clone(),
                file_type: declared.file_type,
                executable: false,
                eager_extract: declared.eager_extract,
                source: FileSource::Fetch(None),
            };
            return Ok(Some(Distribution {
                file,
                source: DistributionSource::Url(declared.url.clone()),
            }));
        }

        let expected = match &declared.digest {
            Some(digest) => ExpectedDigest::Digest(digest.clone()),
            None => ExpectedDigest::Sibling,
        };
        let verified = fetcher.fetch_and_verify(&declared.url, expected, false, None)?;
        let file = File {
            name: declared.file_name.clone(),
            key: Some(self.id.clone()),
            digest: Some(verified.digest),
            file_type: declared.file_type,
            executable: false,
            eager_extract: declared.eager_extract,
            source: FileSource::Provided,
        };
        Ok(Some(Distribution {
            file,
            source: DistributionSource::Path(verified.path),
        }))
    }
}
