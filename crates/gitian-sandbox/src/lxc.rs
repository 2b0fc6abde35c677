//! Linux-container backend driven through the `lxc-*` tools.
//!
//! Each base image is a stopped container; sandboxes are clones of it made
//! with `lxc-copy` and started with cgroup limits.

use crate::backend::SandboxBackend;
use crate::error::{BackendError, Result};
use crate::process;
use crate::types::{ImageSpec, Mount, OutputSender, ResourceLimits, SandboxCommand, SandboxHandle};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

/// Configuration for [`LxcBackend`].
#[derive(Debug, Clone)]
pub struct LxcConfig {
    /// Alternate container path (`-P`), default system path when `None`.
    pub lxc_path: Option<PathBuf>,
    /// Host address as seen from guests (lxcbr0), also the apt-cacher host.
    pub host_ip: String,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            lxc_path: None,
            host_ip: "10.0.3.1".to_string(),
        }
    }
}

/// Sandboxes as cloned LXC containers.
#[derive(Debug, Clone, Default)]
pub struct LxcBackend {
    config: LxcConfig,
}

impl LxcBackend {
    pub fn new(config: LxcConfig) -> Self {
        tracing::info!(host_ip = %config.host_ip, "Creating lxc backend");
        Self { config }
    }

    fn lxc(&self, tool: &str) -> tokio::process::Command {
        let mut cmd = process::command(tool);
        if let Some(path) = &self.config.lxc_path {
            cmd.arg("-P").arg(path);
        }
        cmd
    }

    async fn attach_captured(&self, name: &str, argv: &[&str]) -> Result<std::process::Output> {
        let mut cmd = self.lxc("lxc-attach");
        cmd.args(["-n", name, "--"]).args(argv);
        process::captured("lxc-attach", &mut cmd).await
    }
}

/// Name of the stopped container backing an image.
pub(crate) fn base_name(spec: &ImageSpec) -> String {
    format!("{}-v{}", spec.name(), spec.version)
}

/// Script run once inside a fresh base container.
pub(crate) fn provision_script(spec: &ImageSpec, host_ip: &str) -> String {
    let mut script = String::from(
        "set -e\nfor i in $(seq 30); do getent hosts archive.ubuntu.com >/dev/null && break; sleep 1; done\n",
    );
    if spec.apt_cacher {
        script.push_str(&format!(
            "echo 'Acquire::http::Proxy \"http://{host_ip}:3142\";' > /etc/apt/apt.conf.d/50gitian-cacher\n"
        ));
    }
    script.push_str("export DEBIAN_FRONTEND=noninteractive\n");
    script.push_str(
        "apt-get update\napt-get --no-install-recommends -y install build-essential ca-certificates curl faketime git python3 wget\n",
    );
    script.push_str("mkdir -p /home/gitian/build /home/gitian/out /home/gitian/sign\n");
    script
}

pub(crate) fn start_args(handle: &SandboxHandle, limits: &ResourceLimits, mounts: &[Mount]) -> Vec<String> {
    let mut args = vec![
        "-n".to_string(),
        handle.name.clone(),
        "-d".to_string(),
        "-s".to_string(),
        format!("lxc.cgroup2.memory.max={}M", limits.memory_mb),
        "-s".to_string(),
        format!("lxc.cgroup2.cpu.max={} 100000", u64::from(limits.threads) * 100_000),
    ];
    for mount in mounts {
        let mode = if mount.read_only { "bind,ro" } else { "bind" };
        args.push("-s".to_string());
        args.push(format!(
            "lxc.mount.entry={} {} none {},create=dir 0 0",
            mount.source.display(),
            mount.target.trim_start_matches('/'),
            mode
        ));
    }
    args
}

pub(crate) fn attach_args(handle: &SandboxHandle, command: &SandboxCommand) -> Vec<String> {
    let mut args = vec!["-n".to_string(), handle.name.clone(), "--clear-env".to_string()];
    for (key, value) in &command.env {
        args.push("-v".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("--".to_string());
    if let Some(dir) = &command.workdir {
        args.extend([
            "sh".to_string(),
            "-c".to_string(),
            "cd \"$0\" && exec \"$@\"".to_string(),
            dir.clone(),
        ]);
    }
    args.extend(command.argv());
    args
}

fn is_missing(output: &std::process::Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.contains("does not exist") || stderr.contains("doesn't exist")
}

#[async_trait]
impl SandboxBackend for LxcBackend {
    fn name(&self) -> &'static str {
        "lxc"
    }

    async fn create_image(&self, spec: &ImageSpec) -> Result<()> {
        let start = std::time::Instant::now();
        let base = base_name(spec);
        tracing::info!(image = %base, apt_cacher = spec.apt_cacher, "Building base container");

        let build_err = |e: BackendError| BackendError::ImageBuild {
            image: base.clone(),
            message: e.to_string(),
        };

        let mut destroy = self.lxc("lxc-destroy");
        destroy.args(["-n", base.as_str(), "-f"]);
        // A missing previous base is the normal case.
        let _ = process::captured("lxc-destroy", &mut destroy).await?;

        let mut create = self.lxc("lxc-create");
        create.args([
            "-n",
            base.as_str(),
            "-t",
            "download",
            "--",
            "-d",
            spec.distro.as_str(),
            "-r",
            spec.suite.as_str(),
            "-a",
            spec.arch.as_str(),
        ]);
        let output = process::captured("lxc-create", &mut create).await?;
        process::check("lxc-create", output).map_err(build_err)?;

        let mut boot = self.lxc("lxc-start");
        boot.args(["-n", base.as_str(), "-d"]);
        let output = process::captured("lxc-start", &mut boot).await?;
        process::check("lxc-start", output).map_err(build_err)?;

        let script = provision_script(spec, &self.config.host_ip);
        let provisioned = self
            .attach_captured(&base, &["bash", "-c", script.as_str()])
            .await
            .and_then(|output| process::check("lxc-attach", output));

        let mut stop = self.lxc("lxc-stop");
        stop.args(["-n", base.as_str()]);
        let stopped = process::captured("lxc-stop", &mut stop).await;

        provisioned.map_err(build_err)?;
        if let Err(e) = stopped {
            tracing::warn!(image = %base, error = %e, "Failed to stop base container");
        }

        tracing::info!(
            image = %base,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Base container built"
        );
        Ok(())
    }

    async fn image_exists(&self, spec: &ImageSpec) -> Result<bool> {
        let base = base_name(spec);
        let mut cmd = self.lxc("lxc-info");
        cmd.args(["-n", base.as_str()]);
        let output = process::captured("lxc-info", &mut cmd).await?;
        Ok(output.status.success())
    }

    async fn create(
        &self,
        image: &ImageSpec,
        limits: &ResourceLimits,
        mounts: &[Mount],
    ) -> Result<SandboxHandle> {
        let handle = SandboxHandle::new(image.clone());
        let base = base_name(image);
        tracing::debug!(
            sandbox_id = %handle.id,
            container = %handle.name,
            base = %base,
            "Cloning container"
        );

        let mut copy = self.lxc("lxc-copy");
        copy.args(["-n", base.as_str(), "-N", handle.name.as_str()]);
        let output = process::captured("lxc-copy", &mut copy).await?;
        if !output.status.success() {
            if is_missing(&output) {
                return Err(BackendError::ImageMissing(base));
            }
            let err = process::check("lxc-copy", output).err();
            return Err(BackendError::Unavailable(
                err.map(|e| e.to_string()).unwrap_or_default(),
            ));
        }

        let mut start = self.lxc("lxc-start");
        start.args(start_args(&handle, limits, mounts));
        let output = process::captured("lxc-start", &mut start).await?;
        if let Err(e) = process::check("lxc-start", output) {
            // The clone exists but never ran; do not leak it.
            if let Err(cleanup) = self.destroy(&handle).await {
                tracing::warn!(sandbox_id = %handle.id, error = %cleanup, "Failed to remove unstarted clone");
            }
            return Err(BackendError::Unavailable(e.to_string()));
        }
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
        let mut cmd = self.lxc("lxc-attach");
        cmd.args(attach_args(handle, command));
        process::streamed("lxc-attach", &mut cmd, output).await
    }

    async fn copy_out(&self, handle: &SandboxHandle, path: &str) -> Result<Bytes> {
        let output = self.attach_captured(&handle.name, &["cat", "--", path]).await?;
        if !output.status.success() && String::from_utf8_lossy(&output.stderr).contains("No such file") {
            return Err(BackendError::PathNotFound(path.to_string()));
        }
        let output = process::check("lxc-attach", output)?;
        Ok(Bytes::from(output.stdout))
    }

    async fn copy_in(&self, handle: &SandboxHandle, path: &str, contents: &[u8]) -> Result<()> {
        let mut cmd = self.lxc("lxc-attach");
        cmd.args([
            "-n",
            handle.name.as_str(),
            "--",
            "sh",
            "-c",
            "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"",
            "sh",
            path,
        ]);
        let output = process::with_stdin("lxc-attach", &mut cmd, contents).await?;
        process::check("lxc-attach", output)?;
        Ok(())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let mut stop = self.lxc("lxc-stop");
        stop.args(["-n", handle.name.as_str(), "-k"]);
        // Already stopped or never started.
        let _ = process::captured("lxc-stop", &mut stop).await?;

        let mut cmd = self.lxc("lxc-destroy");
        cmd.args(["-n", handle.name.as_str(), "-f"]);
        let output = process::captured("lxc-destroy", &mut cmd).await?;
        if !output.status.success() && is_missing(&output) {
            tracing::debug!(sandbox_id = %handle.id, "Container already gone");
            return Ok(());
        }
        process::check("lxc-destroy", output)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageSpec {
        ImageSpec {
            label: "macos".into(),
            distro: "ubuntu".into(),
            suite: "bionic".into(),
            arch: "amd64".into(),
            version: "2".into(),
            apt_cacher: false,
        }
    }

    #[test]
    fn test_base_name_carries_version() {
        assert_eq!(base_name(&image()), "gitian-macos-bionic-amd64-v2");
    }

    #[test]
    fn test_start_args_limits() {
        let handle = SandboxHandle::new(image());
        let args = start_args(&handle, &ResourceLimits::new(2, 2000), &[Mount::read_only("/srv/keys", "/gnupg")]);
        assert!(args.contains(&"lxc.cgroup2.memory.max=2000M".to_string()));
        assert!(args.contains(&"lxc.cgroup2.cpu.max=200000 100000".to_string()));
        assert!(args.contains(&"lxc.mount.entry=/srv/keys gnupg none bind,ro,create=dir 0 0".to_string()));
    }

    #[test]
    fn test_attach_args_wrap_workdir() {
        let handle = SandboxHandle::new(image());
        let cmd = SandboxCommand::new("ls").workdir("/home/gitian");
        let args = attach_args(&handle, &cmd);
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..sep + 3], &["sh", "-c"]);
        assert_eq!(args.last().map(String::as_str), Some("ls"));
    }

    #[test]
    fn test_provision_script_cacher_toggle() {
        let mut spec = image();
        assert!(!provision_script(&spec, "10.0.3.1").contains("Acquire::http::Proxy"));
        spec.apt_cacher = true;
        assert!(provision_script(&spec, "10.0.3.1").contains("http://10.0.3.1:3142"));
    }
}
