//! # gitian-core
//!
//! Orchestration layer for deterministic, multi-target release builds.
//!
//! This crate takes a validated [`BuildRequest`] and drives every requested
//! OS target through base image setup, an isolated build, and signing. It
//! then cross-checks the resulting fingerprints against the assertions of
//! other builders.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   gitian-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌────────────────────┐     ┌────────────────────────┐  │
//! │  │ PipelineController │────▶│  DescriptorResolver    │  │
//! │  │   - run()          │     │  (DescriptorSource)    │  │
//! │  │   - subscribe()    │     └────────────────────────┘  │
//! │  └────────────────────┘                                 │
//! │     │ one worker per target, bounded                    │
//! │     ▼                                                    │
//! │  ┌────────────────────┐     ┌────────────────────────┐  │
//! │  │ SandboxProvisioner │────▶│  SandboxBackend        │  │
//! │  │  - ensure_image()  │     │  (gitian-sandbox)      │  │
//! │  │  - with_sandbox()  │     └────────────────────────┘  │
//! │  └────────────────────┘                                 │
//! │     │ scoped Sandbox                                    │
//! │     ▼                                                    │
//! │  ┌────────────────────┐     ┌────────────────────────┐  │
//! │  │ BuildRunner        │────▶│  BuildResultStore      │  │
//! │  │ SignRunner         │     │  LogSink / captured log│  │
//! │  └────────────────────┘     └────────────────────────┘  │
//! │     │ TargetRecord per target                           │
//! │     ▼                                                    │
//! │  ┌────────────────────┐     ┌────────────────────────┐  │
//! │  │ ResultAggregator   │────▶│  ResultsRepository     │  │
//! │  │  - aggregate()     │     │  (gitian.sigs + git)   │  │
//! │  └────────────────────┘     └────────────────────────┘  │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use gitian_core::{
//!     BuildRequest, Mode, PipelineConfig, PipelineContext, PipelineController, SigningIdentity,
//!     Target,
//! };
//! use gitian_sandbox::DockerBackend;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let request = BuildRequest::builder("alice", "0.21.2")
//!     .targets([Target::Linux, Target::Windows])
//!     .mode(Mode::BuildSign)
//!     .threads(4)
//!     .memory_mb(4000)
//!     .build()?;
//!
//! let config = PipelineConfig::builder().workdir("/srv/gitian").build()?;
//! let context = PipelineContext::new(
//!     config,
//!     Arc::new(DockerBackend::default()),
//!     SigningIdentity::gpg("alice"),
//! );
//!
//! let report = PipelineController::new(request, context)
//!     .run(CancellationToken::new())
//!     .await?;
//!
//! for (target, entry) in &report.targets {
//!     println!("{target}: {:?} consensus={:?}", entry.outcome, entry.consensus());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Per-target isolation**: A failing target never stops the others
//! - **Scoped sandboxes**: Every provisioned sandbox is destroyed exactly once
//! - **Image cache**: Base images built once per process and image version
//! - **Deterministic fingerprints**: Order and metadata independent manifests
//! - **Cross-builder verification**: Consensus or mismatch per target
//! - **Cancellation**: Bounded teardown with a full report

mod aggregate;
mod build;
mod config;
mod descriptor;
mod error;
mod log;
mod manifest;
mod pipeline;
mod provisioner;
mod repository;
mod request;
mod sign;
mod store;

pub use aggregate::{
    AggregateReport, CommitStatus, FailureCause, PipelineStatus, ResultAggregator, TargetOutcome,
    TargetRecord, TargetReport, Verification,
};
pub use build::{
    build_command, render_build_script, BuildResult, BuildRunner, BuildStatus, BUILD_DIR,
    BUILD_SCRIPT, OUT_DIR,
};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use descriptor::{
    Descriptor, DescriptorResolver, DescriptorSource, DirectorySource, PackagePin, Remote,
};
pub use error::{
    BuildError, ConfigError, DescriptorError, PipelineError, ProvisionError, RepositoryError,
    RequestError, SigningError, StepError, StoreError,
};
pub use log::{LogCapture, LogForwarder, LogRef, LogSink, Step, StepLog, TracingLogSink};
pub use manifest::{sha256_hex, ArtifactEntry, ArtifactMetadata, Fingerprint, OutputManifest};
pub use pipeline::{
    PipelineContext, PipelineController, PipelineSnapshot, PipelineState, TargetState,
};
pub use provisioner::{BaseImage, ImageSlot, ProvisionerStats, Sandbox, SandboxProvisioner};
pub use repository::{ResultBundle, ResultsRepository, SigsRepository};
pub use request::{BuildRequest, BuildRequestBuilder, Mode, SourceRef, Target};
pub use sign::{
    release_name, render_assert, SignProgram, SignRunner, SignatureAssertion, SigningIdentity,
    GNUPG_MOUNT, SIGN_DIR,
};
pub use store::{is_safe_relative, BuildResultStore};
