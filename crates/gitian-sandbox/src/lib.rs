//! # gitian-sandbox
//!
//! Sandbox backend layer for deterministic release builds.
//! Provides one capability interface, [`SandboxBackend`], over container
//! engines and system containers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use gitian_sandbox::{DockerBackend, ImageSpec, ResourceLimits, SandboxBackend, SandboxCommand};
//!
//! # async fn example() -> gitian_sandbox::Result<()> {
//! let backend = DockerBackend::default();
//! let image = ImageSpec {
//!     label: "linux".into(),
//!     distro: "ubuntu".into(),
//!     suite: "bionic".into(),
//!     arch: "amd64".into(),
//!     version: "1".into(),
//!     apt_cacher: false,
//! };
//!
//! if !backend.image_exists(&image).await? {
//!     backend.create_image(&image).await?;
//! }
//!
//! let limits = ResourceLimits::new(2, 2000);
//! let sandbox = backend.create(&image, &limits, &[]).await?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let code = backend
//!     .run(&sandbox, &SandboxCommand::shell("uname -a"), &limits, tx)
//!     .await?;
//! while let Some(line) = rx.recv().await {
//!     println!("{}", line.line);
//! }
//! assert_eq!(code, 0);
//!
//! backend.destroy(&sandbox).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Image management**: Build and look up versioned base images
//! - **Resource limits**: CPU and memory ceilings per sandbox
//! - **Streaming output**: Command output delivered line by line
//! - **File transfer**: Copy files into and out of a sandbox
//! - **Idempotent teardown**: Destroying a vanished sandbox succeeds

mod backend;
mod docker;
mod error;
mod lxc;
mod process;
mod types;

pub use backend::SandboxBackend;
pub use docker::{DockerBackend, DockerConfig};
pub use error::{BackendError, Result};
pub use lxc::{LxcBackend, LxcConfig};
pub use types::{
    ImageSpec, Mount, OutputLine, OutputSender, OutputStream, ResourceLimits, SandboxCommand,
    SandboxHandle, SandboxId,
};
