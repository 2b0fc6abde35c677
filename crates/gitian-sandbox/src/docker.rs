//! Container-engine backend driven through the `docker` CLI.

use crate::backend::SandboxBackend;
use crate::error::{BackendError, Result};
use crate::process;
use crate::types::{ImageSpec, Mount, OutputSender, ResourceLimits, SandboxCommand, SandboxHandle};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

/// Packages every base image carries before descriptor packages are added.
const BASE_PACKAGES: &[&str] = &[
    "build-essential",
    "ca-certificates",
    "curl",
    "faketime",
    "git",
    "python3",
    "wget",
];

/// Port apt-cacher-ng listens on.
const APT_CACHER_PORT: u16 = 3142;

/// Configuration for [`DockerBackend`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path to the docker binary (default: `docker`).
    pub docker_path: PathBuf,
    /// Host running apt-cacher-ng, as seen from containers.
    pub apt_cacher_host: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_path: PathBuf::from("docker"),
            apt_cacher_host: "172.17.0.1".to_string(),
        }
    }
}

/// Sandboxes as long-running containers (`sleep infinity`) driven with
/// `docker exec`.
#[derive(Debug, Clone, Default)]
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        tracing::info!(docker = %config.docker_path.display(), "Creating docker backend");
        Self { config }
    }

    fn docker(&self) -> tokio::process::Command {
        process::command(&self.program())
    }

    fn program(&self) -> String {
        self.config.docker_path.to_string_lossy().into_owned()
    }
}

/// Render the Dockerfile for a base image.
pub(crate) fn dockerfile(spec: &ImageSpec, apt_cacher_host: &str) -> String {
    let mut lines = vec![
        format!("FROM {}:{}", spec.distro, spec.suite),
        "ENV DEBIAN_FRONTEND=noninteractive".to_string(),
    ];
    if spec.apt_cacher {
        lines.push(format!(
            "RUN echo 'Acquire::http::Proxy \"http://{apt_cacher_host}:{APT_CACHER_PORT}\";' > /etc/apt/apt.conf.d/50gitian-cacher"
        ));
    }
    lines.push(format!(
        "RUN apt-get update && apt-get --no-install-recommends -y install {}",
        BASE_PACKAGES.join(" ")
    ));
    lines.push("RUN mkdir -p /home/gitian/build /home/gitian/out /home/gitian/sign".to_string());
    lines.push("WORKDIR /home/gitian".to_string());
    lines.push(format!("LABEL org.gitian.image-version=\"{}\"", spec.version));
    lines.join("\n") + "\n"
}

fn platform(arch: &str) -> String {
    match arch {
        "i386" => "linux/386".to_string(),
        other => format!("linux/{other}"),
    }
}

pub(crate) fn create_args(handle: &SandboxHandle, limits: &ResourceLimits, mounts: &[Mount]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--pull".to_string(),
        "never".to_string(),
        "--name".to_string(),
        handle.name.clone(),
        "--label".to_string(),
        format!("org.gitian.sandbox={}", handle.id),
        "--platform".to_string(),
        platform(&handle.image.arch),
        "--cpus".to_string(),
        limits.threads.to_string(),
        "--memory".to_string(),
        format!("{}m", limits.memory_mb),
    ];
    for mount in mounts {
        let mode = if mount.read_only { ":ro" } else { "" };
        args.push("-v".to_string());
        args.push(format!("{}:{}{}", mount.source.display(), mount.target, mode));
    }
    args.push(handle.image.tag());
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

pub(crate) fn exec_args(handle: &SandboxHandle, command: &SandboxCommand) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(dir) = &command.workdir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }
    for (key, value) in &command.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(handle.name.clone());
    args.extend(command.argv());
    args
}

fn classify_create_error(err: BackendError, image: &ImageSpec) -> BackendError {
    match err {
        BackendError::Command { ref stderr, .. }
            if stderr.contains("No such image") || stderr.contains("Unable to find image") =>
        {
            BackendError::ImageMissing(image.tag())
        }
        BackendError::Command { stderr, code, .. } => {
            BackendError::Unavailable(format!("docker run exited with {code}: {stderr}"))
        }
        other => other,
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_image(&self, spec: &ImageSpec) -> Result<()> {
        let start = std::time::Instant::now();
        let tag = spec.tag();
        tracing::info!(image = %tag, apt_cacher = spec.apt_cacher, "Building base image");

        let dockerfile = dockerfile(spec, &self.config.apt_cacher_host);
        let platform = platform(&spec.arch);
        let mut cmd = self.docker();
        cmd.args(["build", "--platform", platform.as_str(), "-t", tag.as_str(), "-"]);
        let output = process::with_stdin(&self.program(), &mut cmd, dockerfile.as_bytes()).await?;
        process::check(&self.program(), output).map_err(|e| BackendError::ImageBuild {
            image: tag.clone(),
            message: e.to_string(),
        })?;

        tracing::info!(
            image = %tag,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Base image built"
        );
        Ok(())
    }

    async fn image_exists(&self, spec: &ImageSpec) -> Result<bool> {
        let mut cmd = self.docker();
        let tag = spec.tag();
        cmd.args(["image", "inspect", "--format", "{{.Id}}", tag.as_str()]);
        let output = process::captured(&self.program(), &mut cmd).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such image") {
            return Ok(false);
        }
        process::check(&self.program(), output).map(|_| false)
    }

    async fn create(
        &self,
        image: &ImageSpec,
        limits: &ResourceLimits,
        mounts: &[Mount],
    ) -> Result<SandboxHandle> {
        let handle = SandboxHandle::new(image.clone());
        tracing::debug!(
            sandbox_id = %handle.id,
            container = %handle.name,
            threads = limits.threads,
            memory_mb = limits.memory_mb,
            "Starting container"
        );

        let mut cmd = self.docker();
        cmd.args(create_args(&handle, limits, mounts));
        let output = process::captured(&self.program(), &mut cmd).await?;
        process::check(&self.program(), output).map_err(|e| classify_create_error(e, image))?;
        Ok(handle)
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &SandboxCommand,
        limits: &ResourceLimits,
        output: OutputSender,
    ) -> Result<i32> {
        tracing::debug!(
            sandbox_id = %handle.id,
            program = %command.program,
            threads = limits.threads,
            memory_mb = limits.memory_mb,
            "Executing in container"
        );
        let mut cmd = self.docker();
        cmd.args(exec_args(handle, command));
        process::streamed(&self.program(), &mut cmd, output).await
    }

    async fn copy_out(&self, handle: &SandboxHandle, path: &str) -> Result<Bytes> {
        let mut cmd = self.docker();
        cmd.args(["exec", handle.name.as_str(), "cat", "--", path]);
        let output = process::captured(&self.program(), &mut cmd).await?;
        if !output.status.success() && String::from_utf8_lossy(&output.stderr).contains("No such file") {
            return Err(BackendError::PathNotFound(path.to_string()));
        }
        let output = process::check(&self.program(), output)?;
        tracing::trace!(sandbox_id = %handle.id, path, size = output.stdout.len(), "Copied out");
        Ok(Bytes::from(output.stdout))
    }

    async fn copy_in(&self, handle: &SandboxHandle, path: &str, contents: &[u8]) -> Result<()> {
        let mut cmd = self.docker();
        cmd.args([
            "exec",
            "-i",
            handle.name.as_str(),
            "sh",
            "-c",
            "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"",
            "sh",
            path,
        ]);
        let output = process::with_stdin(&self.program(), &mut cmd, contents).await?;
        process::check(&self.program(), output)?;
        tracing::trace!(sandbox_id = %handle.id, path, size = contents.len(), "Copied in");
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let mut cmd = self.docker();
        cmd.args(["rm", "-f", handle.name.as_str()]);
        let output = process::captured(&self.program(), &mut cmd).await?;
        if !output.status.success() && String::from_utf8_lossy(&output.stderr).contains("No such container") {
            tracing::debug!(sandbox_id = %handle.id, "Container already gone");
            return Ok(());
        }
        process::check(&self.program(), output)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(apt_cacher: bool) -> ImageSpec {
        ImageSpec {
            label: "windows".into(),
            distro: "ubuntu".into(),
            suite: "bionic".into(),
            arch: "amd64".into(),
            version: "1".into(),
            apt_cacher,
        }
    }

    #[test]
    fn test_dockerfile_with_cacher() {
        let file = dockerfile(&image(true), "10.0.3.1");
        assert!(file.starts_with("FROM ubuntu:bionic\n"));
        assert!(file.contains("http://10.0.3.1:3142"));
        assert!(file.contains("org.gitian.image-version=\"1\""));
    }

    #[test]
    fn test_dockerfile_without_cacher() {
        let file = dockerfile(&image(false), "10.0.3.1");
        assert!(!file.contains("Acquire::http::Proxy"));
    }

    #[test]
    fn test_create_args_apply_limits_and_mounts() {
        let handle = SandboxHandle::new(image(false));
        let mounts = [Mount::read_only("/home/me/.gnupg", "/gnupg")];
        let args = create_args(&handle, &ResourceLimits::new(4, 4000), &mounts);

        let joined = args.join(" ");
        assert!(joined.contains("--cpus 4"));
        assert!(joined.contains("--memory 4000m"));
        assert!(joined.contains("-v /home/me/.gnupg:/gnupg:ro"));
        assert!(joined.ends_with("gitian-windows-bionic-amd64:1 sleep infinity"));
    }

    #[test]
    fn test_exec_args_env_and_workdir() {
        let handle = SandboxHandle::new(image(false));
        let cmd = SandboxCommand::new("make")
            .arg("-j4")
            .env("TZ", "UTC")
            .workdir("/home/gitian/build");
        let args = exec_args(&handle, &cmd);
        assert_eq!(args[0], "exec");
        assert_eq!(&args[1..3], &["-w", "/home/gitian/build"]);
        assert_eq!(&args[3..5], &["-e", "TZ=UTC"]);
        assert_eq!(args[5], handle.name);
        assert_eq!(&args[6..], &["make", "-j4"]);
    }

    #[test]
    fn test_missing_image_classified() {
        let err = BackendError::Command {
            program: "docker".into(),
            code: 125,
            stderr: "Unable to find image 'gitian-windows-bionic-amd64:1' locally".into(),
        };
        assert!(matches!(
            classify_create_error(err, &image(false)),
            BackendError::ImageMissing(_)
        ));
    }
}
