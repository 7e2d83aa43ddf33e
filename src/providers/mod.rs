//! Interpreter distribution providers.
//!
//! A provider turns an interpreter declaration into zero-or-one concrete
//! distribution per platform. The registry is an explicit value constructed
//! at startup and threaded into the config resolver, so pluggability never
//! depends on hidden global state.

mod url;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::data::Data;
use crate::fetch::Fetcher;
use crate::model::File;
use crate::platform::Platform;

/// Where a resolved distribution's bytes live.
#[derive(Debug, Clone)]
pub enum DistributionSource {
    /// A remote locator the built scie fetches at runtime.
    Url(String),
    /// A local path resolved at export time through the download cache.
    Path(PathBuf),
}

/// A platform-specific interpreter distribution.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub file: File,
    pub source: DistributionSource,
}

/// A capability that can resolve an interpreter distribution per platform.
pub trait Provider: fmt::Debug {
    /// Resolve this interpreter's distribution for `platform`, if it has
    /// one. Non-lazy providers may fetch through `fetcher` to yield a local
    /// path.
    fn distribution(&self, fetcher: &Fetcher, platform: Platform) -> Result<Option<Distribution>>;
}

/// The interpreter declaration a provider factory is given.
pub struct ProviderContext {
    pub id: String,
    pub lazy: bool,
    /// The interpreter's table minus `id`/`lazy`/`provider`, forwarded
    /// verbatim with its document path intact.
    pub config: Data,
}

pub type ProviderFactory = fn(&ProviderContext) -> Result<Box<dyn Provider>>;

/// A name-to-factory lookup for interpreter providers.
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> ProviderRegistry {
        ProviderRegistry {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the built-in providers registered.
    pub fn with_builtins() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register("url", url::create);
        registry
    }

    pub fn register(&mut self, name: &str, factory: ProviderFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<ProviderFactory> {
        self.factories.get(name).copied()
    }
}

impl Default for ProviderRegistry {
    fn default() -> ProviderRegistry {
        ProviderRegistry::with_builtins()
    }
}
