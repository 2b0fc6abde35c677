//! The immutable build request handed over by the CLI layer.

use crate::error::RequestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// An operating system the release is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Linux,
    Windows,
    MacOs,
}

impl Target {
    /// Every supported target, in report order.
    pub const ALL: [Target; 3] = [Target::Linux, Target::Windows, Target::MacOs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::MacOs => "macos",
        }
    }

    /// Map a one-letter OS flag (`l`, `w`, `m`).
    pub fn from_flag(flag: char) -> Option<Self> {
        match flag {
            'l' => Some(Self::Linux),
            'w' => Some(Self::Windows),
            'm' => Some(Self::MacOs),
            _ => None,
        }
    }

    /// Parse a flag string such as `"lwm"` into a target set.
    pub fn parse_flags(flags: &str) -> Result<BTreeSet<Self>, RequestError> {
        flags
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| Self::from_flag(c).ok_or_else(|| RequestError::UnknownTarget(c.to_string())))
            .collect()
    }

    /// Descriptor file building this target.
    pub fn descriptor_file(&self) -> &'static str {
        match self {
            Self::Linux => "gitian-linux.yml",
            Self::Windows => "gitian-win.yml",
            Self::MacOs => "gitian-osx.yml",
        }
    }

    /// Release directory suffix in the signature repository.
    pub fn release_suffix(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "win-unsigned",
            Self::MacOs => "osx-unsigned",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" | "l" => Ok(Self::Linux),
            "windows" | "win" | "w" => Ok(Self::Windows),
            "macos" | "osx" | "m" => Ok(Self::MacOs),
            other => Err(RequestError::UnknownTarget(other.to_string())),
        }
    }
}

/// What the pipeline should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Only prepare base images.
    Setup,
    /// Build unsigned artifacts.
    Build,
    /// Sign previously built artifacts.
    Sign,
    /// Build, then sign.
    BuildSign,
    /// Cross-check the assertions already in the results repository,
    /// without building or signing anything.
    Verify,
}

impl Mode {
    pub fn includes_build(&self) -> bool {
        matches!(self, Self::Build | Self::BuildSign)
    }

    pub fn includes_sign(&self) -> bool {
        matches!(self, Self::Sign | Self::BuildSign)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Build => write!(f, "build"),
            Self::Sign => write!(f, "sign"),
            Self::BuildSign => write!(f, "buildsign"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

impl FromStr for Mode {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "setup" => Ok(Self::Setup),
            "build" => Ok(Self::Build),
            "sign" => Ok(Self::Sign),
            "buildsign" | "build-sign" => Ok(Self::BuildSign),
            "verify" => Ok(Self::Verify),
            other => Err(RequestError::UnknownMode(other.to_string())),
        }
    }
}

/// How the version string maps onto the source repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRef {
    /// The version is a release tag, checked out as `v<version>`.
    #[default]
    Tag,
    /// The version names a commit or branch, checked out as-is.
    Commit,
    /// The version is a pull request number, labelled `pull-<N>` and built
    /// from the pull request's merge ref.
    Pull,
}

impl SourceRef {
    /// Git ref to check out for `version`.
    pub fn git_ref(&self, version: &str) -> String {
        match self {
            Self::Tag => format!("v{version}"),
            Self::Commit => version.to_string(),
            Self::Pull => format!(
                "refs/pull/{}/merge",
                version.strip_prefix(PULL_PREFIX).unwrap_or(version)
            ),
        }
    }
}

const PULL_PREFIX: &str = "pull-";

/// A validated, immutable request for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    builder: String,
    version: String,
    source: SourceRef,
    source_url: Option<String>,
    targets: BTreeSet<Target>,
    mode: Mode,
    threads: u32,
    memory_mb: u64,
    commit_results: bool,
    apt_cacher: bool,
    detach_sign: bool,
}

impl BuildRequest {
    /// Start building a request for `builder` and `version`.
    pub fn builder(builder: impl Into<String>, version: impl Into<String>) -> BuildRequestBuilder {
        BuildRequestBuilder::new(builder.into(), version.into())
    }

    /// Identity of the person producing this build.
    pub fn builder_identity(&self) -> &str {
        &self.builder
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn source(&self) -> SourceRef {
        self.source
    }

    /// Git ref checked out for the build.
    pub fn git_ref(&self) -> String {
        self.source.git_ref(&self.version)
    }

    /// Repository URL overriding the descriptor's remote.
    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// Targets this run covers.
    ///
    /// A `Setup` request without explicit targets covers every target.
    pub fn targets(&self) -> BTreeSet<Target> {
        if self.mode == Mode::Setup && self.targets.is_empty() {
            return Target::ALL.into_iter().collect();
        }
        self.targets.clone()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    pub fn commit_results(&self) -> bool {
        self.commit_results
    }

    pub fn apt_cacher(&self) -> bool {
        self.apt_cacher
    }

    /// Produce assertions without a real signature; nothing is committed.
    pub fn detach_sign(&self) -> bool {
        self.detach_sign
    }
}

/// Builder for [`BuildRequest`].
#[derive(Debug)]
pub struct BuildRequestBuilder {
    request: BuildRequest,
}

impl BuildRequestBuilder {
    fn new(builder: String, version: String) -> Self {
        Self {
            request: BuildRequest {
                builder,
                version,
                source: SourceRef::Tag,
                source_url: None,
                targets: BTreeSet::new(),
                mode: Mode::Build,
                threads: 2,
                memory_mb: 2000,
                commit_results: true,
                apt_cacher: true,
                detach_sign: false,
            },
        }
    }

    /// Set the target set.
    pub fn targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.request.targets = targets.into_iter().collect();
        self
    }

    /// Set the mode (default: Build).
    pub fn mode(mut self, mode: Mode) -> Self {
        self.request.mode = mode;
        self
    }

    /// Set how the version maps to a git ref (default: Tag).
    pub fn source(mut self, source: SourceRef) -> Self {
        self.request.source = source;
        self
    }

    /// Override the source repository URL.
    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.request.source_url = Some(url.into());
        self
    }

    /// Set the in-sandbox thread count (default: 2).
    pub fn threads(mut self, threads: u32) -> Self {
        self.request.threads = threads;
        self
    }

    /// Set the per-sandbox memory limit in MiB (default: 2000).
    pub fn memory_mb(mut self, memory_mb: u64) -> Self {
        self.request.memory_mb = memory_mb;
        self
    }

    /// Commit results to the results repository (default: true).
    pub fn commit_results(mut self, commit: bool) -> Self {
        self.request.commit_results = commit;
        self
    }

    /// Use the apt-cacher proxy in base images (default: true).
    pub fn apt_cacher(mut self, enabled: bool) -> Self {
        self.request.apt_cacher = enabled;
        self
    }

    /// Only create assertions for later detached signing (default: false).
    pub fn detach_sign(mut self, detach: bool) -> Self {
        self.request.detach_sign = detach;
        self
    }

    /// Validate and build the request.
    pub fn build(self) -> Result<BuildRequest, RequestError> {
        let mut request = self.request;
        if request.builder.trim().is_empty() {
            return Err(RequestError::EmptyBuilder);
        }
        let version_ok = match request.source {
            SourceRef::Tag => is_release_tag(&request.version),
            SourceRef::Commit => is_git_ref(&request.version),
            SourceRef::Pull => is_pull_number(&request.version),
        };
        if !version_ok {
            return Err(RequestError::InvalidVersion(request.version));
        }
        if request.source == SourceRef::Pull && !request.version.starts_with(PULL_PREFIX) {
            request.version = format!("{PULL_PREFIX}{}", request.version);
        }
        if request.mode != Mode::Setup && request.targets.is_empty() {
            return Err(RequestError::NoTargets(request.mode));
        }
        if request.threads == 0 {
            return Err(RequestError::ZeroThreads);
        }
        if request.memory_mb == 0 {
            return Err(RequestError::ZeroMemory);
        }
        Ok(request)
    }
}

/// `MAJOR.MINOR[.PATCH[.BUILD]][rcN]`, digits only.
fn is_release_tag(version: &str) -> bool {
    let (base, rc) = match version.split_once("rc") {
        Some((base, rc)) => (base, Some(rc)),
        None => (version, None),
    };
    if let Some(rc) = rc {
        if rc.is_empty() || !rc.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    let parts: Vec<&str> = base.split('.').collect();
    parts.len() >= 2
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// A branch or commit name following `git check-ref-format`, which also
/// keeps it usable as a relative path below the work directory.
fn is_git_ref(reference: &str) -> bool {
    const FORBIDDEN: &[char] = &['~', '^', ':', '?', '*', '[', '\\'];
    if reference.is_empty()
        || reference == "@"
        || reference.starts_with('-')
        || reference.contains("..")
        || reference.contains("@{")
        || reference.ends_with('.')
        || reference
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || FORBIDDEN.contains(&c))
    {
        return false;
    }
    reference.split('/').all(|component| {
        !component.is_empty() && !component.starts_with('.') && !component.ends_with(".lock")
    })
}

/// `N` or `pull-N`, with `N` a pull request number.
fn is_pull_number(version: &str) -> bool {
    let number = version.strip_prefix(PULL_PREFIX).unwrap_or(version);
    !number.is_empty() && number.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_tags() {
        assert!(is_release_tag("0.21.2"));
        assert!(is_release_tag("0.21.2.1"));
        assert!(is_release_tag("0.18.1rc1"));
        assert!(!is_release_tag("0"));
        assert!(!is_release_tag("v0.21.2"));
        assert!(!is_release_tag("0.21."));
        assert!(!is_release_tag("0.21rc"));
        assert!(!is_release_tag("master"));
    }

    #[test]
    fn test_parse_flags() {
        let all = Target::parse_flags("lwm").unwrap();
        assert_eq!(all.len(), 3);
        let linux = Target::parse_flags("l").unwrap();
        assert_eq!(linux.into_iter().collect::<Vec<_>>(), vec![Target::Linux]);
        assert!(matches!(
            Target::parse_flags("lx"),
            Err(RequestError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_target_names() {
        assert_eq!("osx".parse::<Target>().unwrap(), Target::MacOs);
        assert_eq!("Win".parse::<Target>().unwrap(), Target::Windows);
        assert_eq!(Target::MacOs.to_string(), "macos");
        assert_eq!(Target::Windows.release_suffix(), "win-unsigned");
        assert_eq!(Target::MacOs.descriptor_file(), "gitian-osx.yml");
    }

    #[test]
    fn test_mode_flags() {
        assert!(Mode::BuildSign.includes_build() && Mode::BuildSign.includes_sign());
        assert!(!Mode::Sign.includes_build());
        assert!(!Mode::Setup.includes_build() && !Mode::Setup.includes_sign());
        assert_eq!("build-sign".parse::<Mode>().unwrap(), Mode::BuildSign);
        assert_eq!("verify".parse::<Mode>().unwrap(), Mode::Verify);
        assert!(!Mode::Verify.includes_build() && !Mode::Verify.includes_sign());
    }

    #[test]
    fn test_builder_defaults() {
        let request = BuildRequest::builder("alice", "0.21.2")
            .targets([Target::Linux])
            .build()
            .expect("should build");
        assert_eq!(request.mode(), Mode::Build);
        assert_eq!(request.threads(), 2);
        assert_eq!(request.memory_mb(), 2000);
        assert_eq!(request.git_ref(), "v0.21.2");
        assert!(request.commit_results());
    }

    #[test]
    fn test_builder_rejects_empty_targets() {
        let result = BuildRequest::builder("alice", "0.21.2").build();
        assert!(matches!(result, Err(RequestError::NoTargets(Mode::Build))));
    }

    #[test]
    fn test_setup_without_targets_covers_all() {
        let request = BuildRequest::builder("alice", "0.21.2")
            .mode(Mode::Setup)
            .build()
            .unwrap();
        assert_eq!(request.targets().len(), 3);
    }

    #[test]
    fn test_builder_rejects_zero_resources() {
        let base = || BuildRequest::builder("alice", "0.21.2").targets([Target::Linux]);
        assert!(matches!(base().threads(0).build(), Err(RequestError::ZeroThreads)));
        assert!(matches!(base().memory_mb(0).build(), Err(RequestError::ZeroMemory)));
    }

    #[test]
    fn test_commit_source_accepts_branches() {
        let request = BuildRequest::builder("alice", "feature/deterministic")
            .source(SourceRef::Commit)
            .targets([Target::Windows])
            .build()
            .unwrap();
        assert_eq!(request.git_ref(), "feature/deterministic");

        let bad = BuildRequest::builder("alice", "two words")
            .source(SourceRef::Commit)
            .targets([Target::Windows])
            .build();
        assert!(matches!(bad, Err(RequestError::InvalidVersion(_))));
    }

    #[test]
    fn test_commit_source_rejects_path_like_refs() {
        for reference in [
            "/tmp/x/evil",
            "\\\\server\\share",
            "~/builds",
            "-delete",
            "topic.lock",
            "topic/.hidden",
            "topic//nested",
            "topic/",
            "a/../b",
            "HEAD@{1}",
            "@",
        ] {
            let result = BuildRequest::builder("alice", reference)
                .source(SourceRef::Commit)
                .targets([Target::Linux])
                .build();
            assert!(
                matches!(result, Err(RequestError::InvalidVersion(_))),
                "{reference:?} should be rejected"
            );
        }
        assert!(is_git_ref("0123abcd"));
        assert!(is_git_ref("release/0.21"));
    }

    #[test]
    fn test_pull_source_labels_version() {
        let request = BuildRequest::builder("alice", "742")
            .source(SourceRef::Pull)
            .targets([Target::Linux])
            .build()
            .unwrap();
        assert_eq!(request.version(), "pull-742");
        assert_eq!(request.git_ref(), "refs/pull/742/merge");

        let relabelled = BuildRequest::builder("alice", "pull-742")
            .source(SourceRef::Pull)
            .targets([Target::Linux])
            .build()
            .unwrap();
        assert_eq!(relabelled.version(), "pull-742");

        let bad = BuildRequest::builder("alice", "feature")
            .source(SourceRef::Pull)
            .targets([Target::Linux])
            .build();
        assert!(matches!(bad, Err(RequestError::InvalidVersion(_))));
    }

    #[test]
    fn test_builder_rejects_blank_builder() {
        let result = BuildRequest::builder("  ", "0.21.2")
            .targets([Target::Linux])
            .build();
        assert!(matches!(result, Err(RequestError::EmptyBuilder)));
    }
}
