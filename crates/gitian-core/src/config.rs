//! Pipeline configuration.

use crate::error::ConfigError;
use crate::provisioner::BaseImage;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host-side settings of a pipeline run.
///
/// Every directory lives under `workdir`:
///
/// ```text
/// <workdir>/
///   gitian-descriptors/   descriptor files, optionally per version
///   inputs/               extra inputs copied into build sandboxes
///   gitian.sigs/          results repository (assertions per release)
///   binaries/<version>/   artifacts copied out of build sandboxes
///   state/results/        persisted build results
///   state/logs/           captured step logs
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of every host-side directory.
    pub workdir: PathBuf,
    /// Workers allowed to run at the same time (default: 3).
    pub max_concurrent_targets: usize,
    /// How long cancelled workers get to tear down (default: 60s).
    pub cancel_grace: Duration,
    /// Upper bound for a single sandbox teardown (default: 30s).
    pub destroy_timeout: Duration,
    /// Wait before the single provisioning retry (default: 5s).
    pub provision_retry_backoff: Duration,
    /// Version of base images; bumping it rebuilds them (default: "1").
    pub image_version: String,
    /// Base image for Setup mode and signing sandboxes.
    pub distro: String,
    pub suite: String,
    pub arch: String,
    /// Commit appended results with git (default: true).
    pub git_commit: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            max_concurrent_targets: 3,
            cancel_grace: Duration::from_secs(60),
            destroy_timeout: Duration::from_secs(30),
            provision_retry_backoff: Duration::from_secs(5),
            image_version: "1".into(),
            distro: "ubuntu".into(),
            suite: "bionic".into(),
            arch: "amd64".into(),
            git_commit: true,
        }
    }
}

impl PipelineConfig {
    /// Create a new config builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_targets == 0 {
            return Err(ConfigError::NoConcurrency);
        }
        if self.image_version.trim().is_empty() {
            return Err(ConfigError::EmptyImageVersion);
        }
        if self.destroy_timeout >= self.cancel_grace {
            return Err(ConfigError::DestroyTimeout {
                destroy: self.destroy_timeout,
                grace: self.cancel_grace,
            });
        }
        for (field, value) in [
            ("distro", &self.distro),
            ("suite", &self.suite),
            ("arch", &self.arch),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField(field));
            }
        }
        Ok(())
    }

    pub fn descriptors_dir(&self) -> PathBuf {
        self.workdir.join("gitian-descriptors")
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.workdir.join("inputs")
    }

    pub fn sigs_dir(&self) -> PathBuf {
        self.workdir.join("gitian.sigs")
    }

    pub fn binaries_dir(&self) -> PathBuf {
        self.workdir.join("binaries")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.workdir.join("state").join("results")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workdir.join("state").join("logs")
    }

    /// Base image used for Setup mode and the signing toolchain.
    pub fn base_image(&self, apt_cacher: bool) -> BaseImage {
        BaseImage {
            distro: self.distro.clone(),
            suite: self.suite.clone(),
            arch: self.arch.clone(),
            apt_cacher,
        }
    }
}

/// Builder for PipelineConfig.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the work directory.
    pub fn workdir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.workdir = path.as_ref().to_path_buf();
        self
    }

    /// Set the number of targets processed at once.
    pub fn max_concurrent_targets(mut self, n: usize) -> Self {
        self.config.max_concurrent_targets = n;
        self
    }

    /// Set the cancellation grace period.
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace = grace;
        self
    }

    /// Set the per-sandbox teardown timeout.
    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.config.destroy_timeout = timeout;
        self
    }

    /// Set the provisioning retry backoff.
    pub fn provision_retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.provision_retry_backoff = backoff;
        self
    }

    /// Set the base image version.
    pub fn image_version(mut self, version: impl Into<String>) -> Self {
        self.config.image_version = version.into();
        self
    }

    /// Set distro, suite and architecture of the default base image.
    pub fn base(
        mut self,
        distro: impl Into<String>,
        suite: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        self.config.distro = distro.into();
        self.config.suite = suite.into();
        self.config.arch = arch.into();
        self
    }

    /// Enable or disable git commits of appended results.
    pub fn git_commit(mut self, enabled: bool) -> Self {
        self.config.git_commit = enabled;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
