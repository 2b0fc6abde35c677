//! Locating and validating gitian build descriptors.

use crate::error::DescriptorError;
use crate::manifest::sha256_hex;
use crate::provisioner::BaseImage;
use crate::request::{SourceRef, Target};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Read-only store of descriptor files.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    /// Contents of `file` for `version`, or `None` when there is no such file.
    async fn fetch(&self, version: &str, file: &str) -> std::io::Result<Option<String>>;
}

/// Descriptors checked out on disk.
///
/// A file under `<root>/<version>/` takes precedence over one directly
/// under `<root>/`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DescriptorSource for DirectorySource {
    async fn fetch(&self, version: &str, file: &str) -> std::io::Result<Option<String>> {
        let candidates = [self.root.join(version).join(file), self.root.join(file)];
        for path in candidates {
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => {
                    tracing::debug!(path = %path.display(), "Found descriptor");
                    return Ok(Some(contents));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// One entry of a descriptor's package list: `name` or `name=version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePin {
    pub name: String,
    pub version: Option<String>,
}

impl FromStr for PackagePin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = match s.split_once('=') {
            Some((name, version)) => (name, Some(version)),
            None => (s, None),
        };
        let name_ok = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "+-.:_".contains(c));
        if !name_ok {
            return Err(format!("malformed package name in pin {s:?}"));
        }
        if let Some(version) = version {
            let version_ok = !version.is_empty()
                && version
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "+-.:~_".contains(c));
            if !version_ok {
                return Err(format!("malformed version in pin {s:?}"));
            }
        }
        Ok(Self {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for PackagePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}={}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

/// A repository cloned into the build directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub url: String,
    pub dir: String,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    name: String,
    distro: String,
    #[serde(default)]
    suites: Vec<String>,
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    remotes: Vec<RawRemote>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    script: String,
}

#[derive(Debug, Deserialize)]
struct RawRemote {
    #[serde(default)]
    url: String,
    #[serde(default)]
    dir: String,
}

/// A validated descriptor for one (version, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub version: String,
    pub target: Target,
    /// Descriptor name, e.g. `litecoin-linux-0.18`.
    pub name: String,
    pub distro: String,
    pub suites: Vec<String>,
    pub architectures: Vec<String>,
    /// Pinned build dependencies.
    pub packages: Vec<PackagePin>,
    pub remotes: Vec<Remote>,
    /// Extra input files expected in the build directory.
    pub files: Vec<String>,
    pub script: String,
    /// Git ref the remotes are checked out at.
    pub script_commit: String,
    /// SHA-256 of the descriptor file contents.
    pub digest: String,
}

impl Descriptor {
    /// Parse and validate descriptor `contents`.
    pub fn parse(
        file: &str,
        version: &str,
        target: Target,
        script_commit: &str,
        contents: &str,
    ) -> Result<Self, DescriptorError> {
        let invalid = |message: String| DescriptorError::Validation {
            file: file.to_string(),
            message,
        };

        let raw: RawDescriptor =
            serde_yaml::from_str(contents).map_err(|e| invalid(e.to_string()))?;

        if raw.name.trim().is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if raw.distro.trim().is_empty() {
            return Err(invalid("distro is empty".into()));
        }
        if raw.suites.is_empty() {
            return Err(invalid("no suites".into()));
        }
        if raw.architectures.is_empty() {
            return Err(invalid("no architectures".into()));
        }
        if raw.script.trim().is_empty() {
            return Err(invalid("script is empty".into()));
        }

        let packages = raw
            .packages
            .iter()
            .map(|p| p.trim().parse::<PackagePin>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let mut remotes = Vec::with_capacity(raw.remotes.len());
        for remote in raw.remotes {
            if remote.url.trim().is_empty() {
                return Err(invalid("remote without url".into()));
            }
            if !is_plain_name(&remote.dir) {
                return Err(invalid(format!("bad remote dir {:?}", remote.dir)));
            }
            remotes.push(Remote {
                url: remote.url,
                dir: remote.dir,
            });
        }

        if let Some(bad) = raw.files.iter().find(|f| !is_plain_name(f)) {
            return Err(invalid(format!("bad input file name {bad:?}")));
        }

        Ok(Self {
            version: version.to_string(),
            target,
            name: raw.name,
            distro: raw.distro,
            suites: raw.suites,
            architectures: raw.architectures,
            packages,
            remotes,
            files: raw.files,
            script: raw.script,
            script_commit: script_commit.to_string(),
            digest: sha256_hex(contents.as_bytes()),
        })
    }

    /// Image the build sandbox is started from: the first suite and architecture.
    pub fn base_image(&self, apt_cacher: bool) -> BaseImage {
        BaseImage {
            distro: self.distro.clone(),
            suite: self.suites.first().cloned().unwrap_or_default(),
            arch: self.architectures.first().cloned().unwrap_or_default(),
            apt_cacher,
        }
    }
}

/// A single non-empty path component.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.chars().any(char::is_control)
}

/// Maps (version, target) to a validated [`Descriptor`].
#[derive(Clone)]
pub struct DescriptorResolver {
    source: Arc<dyn DescriptorSource>,
}

impl DescriptorResolver {
    pub fn new(source: Arc<dyn DescriptorSource>) -> Self {
        Self { source }
    }

    /// Resolve the descriptor for `target` at `version`.
    ///
    /// Only reads from the source; the same inputs always give the same
    /// descriptor or the same error.
    pub async fn resolve(
        &self,
        version: &str,
        source_ref: SourceRef,
        target: Target,
    ) -> Result<Descriptor, DescriptorError> {
        let file = target.descriptor_file();
        let contents = self
            .source
            .fetch(version, file)
            .await?
            .ok_or_else(|| DescriptorError::NotFound {
                version: version.to_string(),
                file: file.to_string(),
            })?;

        let descriptor =
            Descriptor::parse(file, version, target, &source_ref.git_ref(version), &contents)?;
        tracing::info!(
            os = %target,
            name = %descriptor.name,
            packages = descriptor.packages.len(),
            "Resolved descriptor"
        );
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX: &str = r#"
name: "litecoin-linux-0.21"
enable_cache: true
distro: "ubuntu"
suites:
- "bionic"
architectures:
- "amd64"
packages:
- "curl"
- "g++-aarch64-linux-gnu"
- "faketime=0.9.7-2"
remotes:
- "url": "https://github.com/litecoin-project/litecoin.git"
  "dir": "litecoin"
files: []
script: |
  set -e -o pipefail
  make -C depends -j"$JOBS"
"#;

    #[test]
    fn test_parse_descriptor() {
        let d = Descriptor::parse("gitian-linux.yml", "0.21.2", Target::Linux, "v0.21.2", LINUX)
            .expect("should parse");
        assert_eq!(d.name, "litecoin-linux-0.21");
        assert_eq!(d.packages.len(), 3);
        assert_eq!(d.packages[2].version.as_deref(), Some("0.9.7-2"));
        assert_eq!(d.remotes[0].dir, "litecoin");
        assert_eq!(d.script_commit, "v0.21.2");
        assert_eq!(d.digest, sha256_hex(LINUX.as_bytes()));
        assert_eq!(d.base_image(false).suite, "bionic");
    }

    #[test]
    fn test_rejects_malformed_pin() {
        let contents = LINUX.replace("\"curl\"", "\"curl==7\"");
        let err = Descriptor::parse("gitian-linux.yml", "0.21.2", Target::Linux, "v0.21.2", &contents)
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Validation { .. }));
    }

    #[test]
    fn test_rejects_missing_script() {
        let contents = "name: x\ndistro: ubuntu\nsuites: [bionic]\narchitectures: [amd64]\n";
        let err = Descriptor::parse("f.yml", "1.0", Target::Linux, "v1.0", contents).unwrap_err();
        assert!(matches!(err, DescriptorError::Validation { message, .. } if message.contains("script")));
    }

    #[test]
    fn test_rejects_unsafe_input_name() {
        let contents = LINUX.replace("files: []", "files: [\"../../etc/passwd\"]");
        assert!(Descriptor::parse("f.yml", "1.0", Target::Linux, "v1.0", &contents).is_err());
    }

    #[test]
    fn test_pin_round_trip_display() {
        let pin: PackagePin = "libssl-dev=1.1.1".parse().unwrap();
        assert_eq!(pin.to_string(), "libssl-dev=1.1.1");
        assert!("=1.0".parse::<PackagePin>().is_err());
        assert!("gcc=".parse::<PackagePin>().is_err());
    }

    #[tokio::test]
    async fn test_directory_source_prefers_versioned_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("0.21.2")).unwrap();
        std::fs::write(dir.path().join("gitian-linux.yml"), "generic").unwrap();
        std::fs::write(dir.path().join("0.21.2/gitian-linux.yml"), "versioned").unwrap();

        let source = DirectorySource::new(dir.path());
        let found = source.fetch("0.21.2", "gitian-linux.yml").await.unwrap();
        assert_eq!(found.as_deref(), Some("versioned"));
        let fallback = source.fetch("0.20.0", "gitian-linux.yml").await.unwrap();
        assert_eq!(fallback.as_deref(), Some("generic"));
        assert!(source.fetch("0.21.2", "gitian-osx.yml").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolver_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DescriptorResolver::new(Arc::new(DirectorySource::new(dir.path())));
        let err = resolver
            .resolve("0.21.2", SourceRef::Tag, Target::MacOs)
            .await
            .unwrap_err();
        assert!(matches!(err, DescriptorError::NotFound { file, .. } if file == "gitian-osx.yml"));
    }
}
