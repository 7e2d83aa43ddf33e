//! scie-builder turns a declarative lift configuration into self-contained
//! scie executables.
//!
//! The pipeline: parse the `[lift]` TOML document into an immutable
//! [`model::Application`], resolve interpreter distributions through
//! registered [`providers`], fetch and verify remote artifacts through the
//! locked download [`cache`], stage everything per platform and emit a
//! [`lift`] manifest, then hand the manifest to the scie-jump assembler.

pub mod a_scie;
pub mod build;
pub mod cache;
pub mod config;
pub mod export;
pub mod fetch;
pub mod lift;
pub mod model;
pub mod platform;
pub mod providers;

mod hashing;

#[cfg(test)]
pub(crate) mod test_support;
