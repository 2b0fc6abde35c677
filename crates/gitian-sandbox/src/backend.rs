//! The capability interface every sandbox technology implements.

use crate::error::Result;
use crate::types::{ImageSpec, Mount, OutputSender, ResourceLimits, SandboxCommand, SandboxHandle};
use async_trait::async_trait;
use bytes::Bytes;

/// Create, drive and tear down isolated build environments.
///
/// Implementations are agnostic of what runs inside: the orchestration layer
/// only ever asks for an image, a sandbox started from it, commands run in
/// it, files moved across the boundary, and finally its destruction.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name used in logs (`docker`, `lxc`).
    fn name(&self) -> &'static str;

    /// Build (or rebuild) the base image described by `spec`.
    async fn create_image(&self, spec: &ImageSpec) -> Result<()>;

    /// Check whether the base image for `spec` is present.
    async fn image_exists(&self, spec: &ImageSpec) -> Result<bool>;

    /// Start a sandbox from `image` under the given resource limits.
    async fn create(
        &self,
        image: &ImageSpec,
        limits: &ResourceLimits,
        mounts: &[Mount],
    ) -> Result<SandboxHandle>;

    /// Run `command` inside the sandbox, streaming every output line to
    /// `output`, and return its exit code.
    ///
    /// A non-zero exit code is not an error; errors mean the command could
    /// not be run at all.
    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &SandboxCommand,
        limits: &ResourceLimits,
        output: OutputSender,
    ) -> Result<i32>;

    /// Read a file from inside the sandbox.
    async fn copy_out(&self, handle: &SandboxHandle, path: &str) -> Result<Bytes>;

    /// Write a file inside the sandbox, creating parent directories.
    async fn copy_in(&self, handle: &SandboxHandle, path: &str, contents: &[u8]) -> Result<()>;

    /// Destroy the sandbox. Must succeed when the sandbox is already gone.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;
}
