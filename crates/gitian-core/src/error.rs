//! Error types for gitian-core.

use crate::aggregate::AggregateReport;
use crate::build::BuildStatus;
use crate::request::Mode;
use gitian_sandbox::BackendError;
use std::path::PathBuf;
use thiserror::Error;

/// Rejected [`BuildRequest`](crate::BuildRequest).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("builder identity must not be empty")]
    EmptyBuilder,

    #[error("invalid version or ref: {0:?}")]
    InvalidVersion(String),

    #[error("mode {0} requires at least one target")]
    NoTargets(Mode),

    #[error("thread count must be > 0")]
    ZeroThreads,

    #[error("memory limit must be > 0")]
    ZeroMemory,

    #[error("unknown target: {0:?}")]
    UnknownTarget(String),

    #[error("unknown mode: {0:?}")]
    UnknownMode(String),
}

/// Rejected [`PipelineConfig`](crate::PipelineConfig).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent_targets must be > 0")]
    NoConcurrency,

    #[error("image_version must not be empty")]
    EmptyImageVersion,

    #[error("destroy_timeout ({destroy:?}) must be shorter than cancel_grace ({grace:?})")]
    DestroyTimeout {
        destroy: std::time::Duration,
        grace: std::time::Duration,
    },

    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

/// Failure to obtain a sandbox or its base image.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Setup never produced a base image for this slot.
    #[error("no base image registered for {0}")]
    MissingImage(String),

    /// The backend could not allocate the sandbox, even after a retry.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    /// Building the base image failed.
    #[error("failed to prepare image {image}: {source}")]
    Image {
        image: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failure to resolve a descriptor for a (version, target) pair.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("no descriptor {file} for version {version}")]
    NotFound { version: String, file: String },

    #[error("invalid descriptor {file}: {message}")]
    Validation { file: String, message: String },

    #[error("descriptor source error: {0}")]
    Source(#[from] std::io::Error),
}

/// A fault while driving a build, as opposed to the build itself failing.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("listing build outputs exited with code {0}")]
    Listing(i32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of the signing step.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing identity {0:?} is not available")]
    IdentityUnavailable(String),

    #[error("signing exited with code {exit_code}")]
    Failed { exit_code: i32 },

    /// Only successful builds with a fingerprint can be signed.
    #[error("cannot sign a build with status {0:?}")]
    UnsignableBuild(BuildStatus),

    #[error("failed to render assert document: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failure of the local result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refusing unsafe artifact path {0:?}")]
    UnsafePath(String),

    #[error("corrupt stored result {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of the results repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("git {command} exited with code {code}: {stderr}")]
    Git {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("invalid builder name {0:?}")]
    InvalidBuilder(String),

    #[error("{builder} already signed {signed}, refusing unsigned results for {built}")]
    AssertionConflict {
        builder: String,
        signed: String,
        built: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a scoped sandbox step did not produce a value.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("step cancelled")]
    Cancelled,

    #[error("step panicked: {0}")]
    Panicked(String),
}

/// Errors surfaced to the caller of [`PipelineController::run`](crate::PipelineController::run).
///
/// Everything that concerns a single target ends up in that target's entry
/// of the report instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The run was cancelled; the report lists every target.
    #[error("pipeline cancelled")]
    Cancelled(Box<AggregateReport>),
}
