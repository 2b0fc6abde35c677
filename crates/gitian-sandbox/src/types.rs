//! Value types shared by every sandbox backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique identifier for a sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Description of a base image that sandboxes are started from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Slot the image serves (`linux`, `windows`, `macos`, `toolchain`).
    pub label: String,
    /// Distribution family, e.g. `ubuntu`.
    pub distro: String,
    /// Distribution suite, e.g. `bionic`.
    pub suite: String,
    /// Architecture, e.g. `amd64`.
    pub arch: String,
    /// Image version; bumping it forces a rebuild.
    pub version: String,
    /// Route package downloads through an apt-cacher proxy.
    pub apt_cacher: bool,
}

impl ImageSpec {
    /// Backend-neutral image name, e.g. `gitian-linux-bionic-amd64`.
    pub fn name(&self) -> String {
        format!("gitian-{}-{}-{}", self.label, self.suite, self.arch)
    }

    /// Image name with its version tag, e.g. `gitian-linux-bionic-amd64:1`.
    pub fn tag(&self) -> String {
        format!("{}:{}", self.name(), self.version)
    }
}

/// Resource constraints applied to one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU threads available to the in-sandbox build.
    pub threads: u32,
    /// Memory ceiling in MiB.
    pub memory_mb: u64,
}

impl ResourceLimits {
    pub fn new(threads: u32, memory_mb: u64) -> Self {
        Self { threads, memory_mb }
    }
}

/// A host path made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Path on the host.
    pub source: PathBuf,
    /// Path inside the sandbox.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl Mount {
    /// Read-only bind mount.
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// A command to execute inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

impl SandboxCommand {
    /// Create a command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Run `script` through `bash -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("bash").arg("-c").arg(script)
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// A live sandbox as seen by its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: SandboxId,
    /// Backend-side instance name (container name).
    pub name: String,
    /// Image the sandbox was started from.
    pub image: ImageSpec,
    pub created_at: DateTime<Utc>,
}

impl SandboxHandle {
    /// Create a handle with a fresh ID and a `gitian-<label>-<id>` instance name.
    pub fn new(image: ImageSpec) -> Self {
        let id = SandboxId::new();
        Self {
            name: format!("gitian-{}-{}", image.label, id),
            id,
            image,
            created_at: Utc::now(),
        }
    }
}

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

impl OutputLine {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            line: line.into(),
        }
    }
}

/// Channel end receiving streamed output of a sandbox command.
pub type OutputSender = mpsc::UnboundedSender<OutputLine>;

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ImageSpec {
        ImageSpec {
            label: "linux".into(),
            distro: "ubuntu".into(),
            suite: "bionic".into(),
            arch: "amd64".into(),
            version: "3".into(),
            apt_cacher: true,
        }
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(spec().name(), "gitian-linux-bionic-amd64");
        assert_eq!(spec().tag(), "gitian-linux-bionic-amd64:3");
    }

    #[test]
    fn test_handle_name_contains_label_and_id() {
        let handle = SandboxHandle::new(spec());
        assert!(handle.name.starts_with("gitian-linux-"));
        assert!(handle.name.ends_with(&handle.id.to_string()));
    }

    #[test]
    fn test_shell_command_argv() {
        let cmd = SandboxCommand::shell("make -j4").env("TZ", "UTC");
        assert_eq!(cmd.argv(), vec!["bash", "-c", "make -j4"]);
        assert_eq!(cmd.env.get("TZ").map(String::as_str), Some("UTC"));
    }
}
