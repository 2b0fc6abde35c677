//! Configuration for the `gitian-build` binary.
//!
//! Configuration is loaded from environment variables and the two
//! positional arguments, with defaults matching the release process.

use gitian_core::{
    BuildRequest, ConfigError, Mode, PipelineConfig, RequestError, SigningIdentity, SourceRef,
    Target,
};
use gitian_sandbox::{DockerBackend, DockerConfig, LxcBackend, LxcConfig, SandboxBackend};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Sandbox technology to build in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Docker,
    Lxc,
}

impl BackendKind {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "lxc" => Some(Self::Lxc),
            _ => None,
        }
    }
}

/// Invalid command line or environment.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("missing signer: pass it as the first argument or set GITIAN_SIGNER")]
    MissingSigner,

    #[error("missing version: pass it as the second argument or set GITIAN_VERSION")]
    MissingVersion,

    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the binary needs to start a pipeline.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub signer: String,
    pub version: String,
    pub mode: Mode,
    pub targets: BTreeSet<Target>,
    pub threads: u32,
    pub memory_mb: u64,
    /// How the version maps onto the source repository.
    pub source: SourceRef,
    pub url: Option<String>,
    pub commit_results: bool,
    pub detach_sign: bool,
    pub apt_cacher: bool,
    pub backend: BackendKind,
    /// Host address as seen from sandboxes; backend default when unset.
    pub host_ip: Option<String>,
    pub workdir: PathBuf,
    pub max_targets: usize,
    pub gnupg_home: Option<PathBuf>,
}

impl CliConfig {
    /// Load configuration from the process environment and `args`
    /// (without the program name).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `GITIAN_SIGNER` / arg 1 | required |
    /// | `GITIAN_VERSION` / arg 2 | required |
    /// | `GITIAN_MODE` | `build` (setup, build, sign, buildsign, verify) |
    /// | `GITIAN_OS` | `lwm` |
    /// | `GITIAN_JOBS` | `2` |
    /// | `GITIAN_MEMORY` | `2000` |
    /// | `GITIAN_COMMIT` | `false` |
    /// | `GITIAN_PULL` | `false` |
    /// | `GITIAN_URL` | descriptor remote |
    /// | `GITIAN_NO_COMMIT` | `false` |
    /// | `GITIAN_DETACH_SIGN` | `false` |
    /// | `GITIAN_DISABLE_APT_CACHER` | `false` |
    /// | `GITIAN_BACKEND` | `docker` (docker, lxc) |
    /// | `GITIAN_HOST_IP` | backend default |
    /// | `GITIAN_WORKDIR` | `.` |
    /// | `GITIAN_MAX_TARGETS` | `3` |
    /// | `GITIAN_GNUPGHOME` | unset |
    pub fn from_env(args: &[String]) -> Result<Self, CliError> {
        Self::from_vars(args, |key| std::env::var(key).ok())
    }

    /// Same as [`CliConfig::from_env`] with variables taken from `var`.
    pub fn from_vars(
        args: &[String],
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CliError> {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let signer = args
            .first()
            .cloned()
            .or_else(|| var("GITIAN_SIGNER"))
            .ok_or(CliError::MissingSigner)?;
        let version = args
            .get(1)
            .cloned()
            .or_else(|| var("GITIAN_VERSION"))
            .ok_or(CliError::MissingVersion)?;

        let mode = match var("GITIAN_MODE") {
            Some(v) => v.parse().map_err(|e: RequestError| invalid("GITIAN_MODE", &v, e))?,
            None => Mode::Build,
        };
        let targets = match var("GITIAN_OS") {
            Some(v) => Target::parse_flags(&v).map_err(|e| invalid("GITIAN_OS", &v, e))?,
            None => Target::ALL.into_iter().collect(),
        };

        let source = match (flag(&var, "GITIAN_COMMIT")?, flag(&var, "GITIAN_PULL")?) {
            (true, true) => {
                return Err(invalid(
                    "GITIAN_PULL",
                    "true",
                    "cannot be combined with GITIAN_COMMIT",
                ))
            }
            (true, false) => SourceRef::Commit,
            (false, true) => SourceRef::Pull,
            (false, false) => SourceRef::Tag,
        };

        Ok(Self {
            signer,
            version,
            mode,
            targets,
            threads: number(&var, "GITIAN_JOBS", 2)?,
            memory_mb: number(&var, "GITIAN_MEMORY", 2000)?,
            source,
            url: var("GITIAN_URL"),
            commit_results: !flag(&var, "GITIAN_NO_COMMIT")?,
            detach_sign: flag(&var, "GITIAN_DETACH_SIGN")?,
            apt_cacher: !flag(&var, "GITIAN_DISABLE_APT_CACHER")?,
            backend: match var("GITIAN_BACKEND") {
                Some(v) => BackendKind::parse(&v)
                    .ok_or_else(|| invalid("GITIAN_BACKEND", &v, "expected docker or lxc"))?,
                None => BackendKind::default(),
            },
            host_ip: var("GITIAN_HOST_IP"),
            workdir: var("GITIAN_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            max_targets: number(&var, "GITIAN_MAX_TARGETS", 3)?,
            gnupg_home: var("GITIAN_GNUPGHOME").map(PathBuf::from),
        })
    }

    /// The validated build request.
    pub fn request(&self) -> Result<BuildRequest, RequestError> {
        let mut builder = BuildRequest::builder(self.signer.as_str(), self.version.as_str())
            .mode(self.mode)
            .targets(self.targets.iter().copied())
            .source(self.source)
            .threads(self.threads)
            .memory_mb(self.memory_mb)
            .commit_results(self.commit_results)
            .apt_cacher(self.apt_cacher)
            .detach_sign(self.detach_sign);
        if let Some(url) = &self.url {
            builder = builder.source_url(url.as_str());
        }
        builder.build()
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        PipelineConfig::builder()
            .workdir(&self.workdir)
            .max_concurrent_targets(self.max_targets)
            .git_commit(self.commit_results)
            .build()
    }

    pub fn signing_identity(&self) -> SigningIdentity {
        let identity = SigningIdentity::gpg(self.signer.as_str());
        match &self.gnupg_home {
            Some(home) => identity.with_gnupg_home(home),
            None => identity,
        }
    }

    pub fn backend(&self) -> Arc<dyn SandboxBackend> {
        match self.backend {
            BackendKind::Docker => {
                let mut config = DockerConfig::default();
                if let Some(ip) = &self.host_ip {
                    config.apt_cacher_host = ip.clone();
                }
                Arc::new(DockerBackend::new(config))
            }
            BackendKind::Lxc => {
                let mut config = LxcConfig::default();
                if let Some(ip) = &self.host_ip {
                    config.host_ip = ip.clone();
                }
                Arc::new(LxcBackend::new(config))
            }
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> CliError {
    CliError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn flag(var: impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, CliError> {
    match var(key) {
        None => Ok(false),
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &v, "expected a boolean")),
        },
    }
}

fn number<T>(var: impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, CliError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e| invalid(key, &v, e)),
    }
}
