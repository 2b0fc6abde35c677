//! The results repository collecting assertions from every builder.

use crate::error::RepositoryError;
use crate::manifest::{Fingerprint, OutputManifest};
use crate::request::Target;
use crate::sign::{release_name, SignatureAssertion};
use crate::store::replace_dir;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const ASSERTION_FILE: &str = "assertion.json";
const MANIFEST_FILE: &str = "manifest.json";
const STAGING_DIR: &str = ".staging";

/// Everything committed for one (version, target, builder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub version: String,
    pub target: Target,
    pub builder: String,
    pub fingerprint: Fingerprint,
    pub manifest: OutputManifest,
    /// Absent for build-only runs.
    pub assertion: Option<SignatureAssertion>,
}

/// Append-only store of per-builder results, keyed by (version, target, builder).
#[async_trait]
pub trait ResultsRepository: Send + Sync {
    /// Every assertion recorded for (version, target), from all builders.
    async fn load_assertions(
        &self,
        version: &str,
        target: Target,
    ) -> Result<Vec<SignatureAssertion>, RepositoryError>;

    /// Store a bundle, replacing the same builder's earlier bundle as a
    /// whole. Returns where it was stored.
    ///
    /// A bundle without an assertion never drops an assertion the builder
    /// already filed: one over the same fingerprint is kept, one over a
    /// different fingerprint is an [`RepositoryError::AssertionConflict`].
    async fn append(&self, bundle: &ResultBundle) -> Result<PathBuf, RepositoryError>;

    /// Record appended bundles (e.g. as a version-control commit).
    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<(), RepositoryError>;
}

/// A gitian.sigs-style checkout: `<root>/<version>-<suffix>/<builder>/`.
#[derive(Debug, Clone)]
pub struct SigsRepository {
    root: PathBuf,
    git: bool,
}

impl SigsRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git: true,
        }
    }

    /// Enable or disable git commits (default: enabled).
    pub fn with_git(mut self, git: bool) -> Self {
        self.git = git;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn builder_dir(&self, version: &str, target: Target, builder: &str) -> PathBuf {
        self.root.join(release_name(version, target)).join(builder)
    }

    async fn write_bundle(&self, dir: &Path, bundle: &ResultBundle) -> Result<(), RepositoryError> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&bundle.manifest)?,
        )
        .await?;
        if let Some(assertion) = &bundle.assertion {
            tokio::fs::write(dir.join(ASSERTION_FILE), serde_json::to_vec_pretty(assertion)?)
                .await?;
            tokio::fs::write(dir.join(&assertion.assert_name), &assertion.assert_document).await?;
            if !assertion.signature.is_empty() {
                tokio::fs::write(
                    dir.join(format!("{}.sig", assertion.assert_name)),
                    &assertion.signature,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// The assertion already filed in `dir`, which an unsigned bundle for
    /// the same output keeps. An unsigned bundle for different output may
    /// not replace it.
    async fn signed_assertion(
        &self,
        dir: &Path,
        bundle: &ResultBundle,
    ) -> Result<Option<SignatureAssertion>, RepositoryError> {
        let path = dir.join(ASSERTION_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<SignatureAssertion>(&bytes) {
            Ok(assertion) if assertion.fingerprint == bundle.fingerprint => {
                tracing::debug!(os = %bundle.target, builder = %bundle.builder, "Keeping existing assertion");
                Ok(Some(assertion))
            }
            Ok(assertion) => Err(RepositoryError::AssertionConflict {
                builder: bundle.builder.clone(),
                signed: assertion.fingerprint.to_string(),
                built: bundle.fingerprint.to_string(),
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Dropping unreadable assertion");
                Ok(None)
            }
        }
    }

    async fn git(&self, args: &[&str]) -> Result<(), RepositoryError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(RepositoryError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResultsRepository for SigsRepository {
    async fn load_assertions(
        &self,
        version: &str,
        target: Target,
    ) -> Result<Vec<SignatureAssertion>, RepositoryError> {
        let release_dir = self.root.join(release_name(version, target));
        let mut entries = match tokio::fs::read_dir(&release_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut assertions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(ASSERTION_FILE);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<SignatureAssertion>(&bytes) {
                Ok(assertion) if assertion.version == version && assertion.target == target => {
                    assertions.push(assertion)
                }
                Ok(_) => tracing::warn!(path = %path.display(), "Assertion filed under the wrong release"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable assertion"),
            }
        }
        assertions.sort_by(|a, b| a.builder.cmp(&b.builder));
        Ok(assertions)
    }

    async fn append(&self, bundle: &ResultBundle) -> Result<PathBuf, RepositoryError> {
        if bundle.builder.is_empty()
            || bundle.builder.starts_with('.')
            || bundle.builder.contains(['/', '\\'])
        {
            return Err(RepositoryError::InvalidBuilder(bundle.builder.clone()));
        }

        let final_dir = self.builder_dir(&bundle.version, bundle.target, &bundle.builder);
        let carried;
        let bundle = match &bundle.assertion {
            Some(_) => bundle,
            None => match self.signed_assertion(&final_dir, bundle).await? {
                Some(assertion) => {
                    carried = ResultBundle {
                        assertion: Some(assertion),
                        ..bundle.clone()
                    };
                    &carried
                }
                None => bundle,
            },
        };

        let staging_root = self.root.join(STAGING_DIR);
        let staged = staging_root.join(uuid::Uuid::new_v4().to_string());
        let retired = staging_root.join(format!("{}-old", uuid::Uuid::new_v4()));

        if let Err(e) = self.write_bundle(&staged, bundle).await {
            let _ = tokio::fs::remove_dir_all(&staged).await;
            return Err(e);
        }
        replace_dir(&staged, &final_dir, &retired).await?;

        tracing::info!(
            os = %bundle.target,
            builder = %bundle.builder,
            path = %final_dir.display(),
            "Results appended"
        );
        Ok(final_dir)
    }

    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<(), RepositoryError> {
        if !self.git || paths.is_empty() {
            return Ok(());
        }
        let relative: Vec<String> = paths
            .iter()
            .map(|p| {
                p.strip_prefix(&self.root)
                    .unwrap_or(p)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        let mut add = vec!["add", "--"];
        add.extend(relative.iter().map(String::as_str));
        self.git(&add).await?;
        self.git(&["commit", "-m", message]).await?;
        tracing::info!(commit_message = message, paths = paths.len(), "Committed results");
        Ok(())
    }
}
