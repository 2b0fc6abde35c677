//! # gitian-cli
//!
//! Environment and argument handling for the `gitian-build` binary. The
//! binary only turns a [`CliConfig`] into a pipeline run; everything else
//! lives in `gitian-core`.

pub mod config;

pub use config::{BackendKind, CliConfig, CliError};
