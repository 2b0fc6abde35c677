//! Persisted build results and copied-out artifacts.

use crate::build::BuildResult;
use crate::error::StoreError;
use crate::request::Target;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

const STAGING_DIR: &str = ".staging";

/// Local store keyed by (version, target).
///
/// ```text
/// <results>/<version>/<target>.json      the BuildResult
/// <binaries>/<version>/<target>/<path>   its artifacts
/// ```
///
/// Each target only ever writes under its own key.
#[derive(Debug, Clone)]
pub struct BuildResultStore {
    results_dir: PathBuf,
    binaries_dir: PathBuf,
}

impl BuildResultStore {
    pub fn new(results_dir: impl Into<PathBuf>, binaries_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            binaries_dir: binaries_dir.into(),
        }
    }

    fn result_path(&self, version: &str, target: Target) -> PathBuf {
        self.results_dir
            .join(version)
            .join(format!("{}.json", target.as_str()))
    }

    /// Directory holding the artifacts of one target.
    pub fn artifacts_dir(&self, version: &str, target: Target) -> PathBuf {
        self.binaries_dir.join(version).join(target.as_str())
    }

    /// Host path for an artifact, rejecting paths that escape the directory.
    pub fn artifact_path(
        &self,
        version: &str,
        target: Target,
        relative: &str,
    ) -> Result<PathBuf, StoreError> {
        if !is_safe_relative(relative) {
            return Err(StoreError::UnsafePath(relative.to_string()));
        }
        Ok(self.artifacts_dir(version, target).join(relative))
    }

    /// Remove artifacts of an earlier build of the same (version, target).
    pub async fn clear_artifacts(&self, version: &str, target: Target) -> Result<(), StoreError> {
        remove_if_present(tokio::fs::remove_dir_all(self.artifacts_dir(version, target)).await)
    }

    /// Start collecting the artifacts of a new build of (version, target).
    ///
    /// Nothing under the target's artifact directory changes until
    /// [`ArtifactStage::publish`].
    pub fn stage_artifacts(&self, version: &str, target: Target) -> ArtifactStage {
        let staging = self.binaries_dir.join(STAGING_DIR);
        ArtifactStage {
            dir: staging.join(uuid::Uuid::new_v4().to_string()),
            retired: staging.join(format!("{}-old", uuid::Uuid::new_v4())),
            final_dir: self.artifacts_dir(version, target),
        }
    }

    /// Forget the stored result of (version, target), leaving its artifacts.
    pub async fn remove_result(&self, version: &str, target: Target) -> Result<(), StoreError> {
        remove_if_present(tokio::fs::remove_file(self.result_path(version, target)).await)
    }

    /// Drop everything stored for (version, target), so nothing can resume
    /// from an outdated build.
    pub async fn invalidate(&self, version: &str, target: Target) -> Result<(), StoreError> {
        self.remove_result(version, target).await?;
        self.clear_artifacts(version, target).await?;
        tracing::debug!(os = %target, version, "Invalidated stored build");
        Ok(())
    }

    /// Persist a result, replacing any earlier one atomically.
    pub async fn save(&self, result: &BuildResult) -> Result<PathBuf, StoreError> {
        let path = self.result_path(&result.version, result.target);
        let json = serde_json::to_vec_pretty(result)?;
        write_atomic(&path, &json).await?;
        tracing::debug!(os = %result.target, path = %path.display(), "Saved build result");
        Ok(path)
    }

    /// Load the stored result for (version, target), if any.
    pub async fn load(
        &self,
        version: &str,
        target: Target,
    ) -> Result<Option<BuildResult>, StoreError> {
        let path = self.result_path(version, target);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }
}

/// Artifacts of one build, written beside the store and moved into place as
/// a whole.
#[derive(Debug)]
pub struct ArtifactStage {
    dir: PathBuf,
    retired: PathBuf,
    final_dir: PathBuf,
}

impl ArtifactStage {
    /// Write one artifact into the stage, rejecting paths that escape it.
    pub async fn write(&self, relative: &str, contents: &[u8]) -> Result<PathBuf, StoreError> {
        if !is_safe_relative(relative) {
            return Err(StoreError::UnsafePath(relative.to_string()));
        }
        let path = self.dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Replace the target's artifact directory with the staged one.
    pub async fn publish(self) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        replace_dir(&self.dir, &self.final_dir, &self.retired).await?;
        Ok(self.final_dir)
    }

    /// Throw the staged artifacts away.
    pub async fn discard(self) {
        if let Err(e) = remove_if_present(tokio::fs::remove_dir_all(&self.dir).await) {
            tracing::warn!(path = %self.dir.display(), error = %e, "Failed to remove staged artifacts");
        }
    }
}

fn remove_if_present(result: std::io::Result<()>) -> Result<(), StoreError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Move `staged` to `target`, replacing an existing directory as a whole.
///
/// The previous directory is parked at `retired` and moved back if the
/// swap fails. `staged` is removed on failure.
pub(crate) async fn replace_dir(staged: &Path, target: &Path, retired: &Path) -> std::io::Result<()> {
    let cleanup = || async {
        let _ = tokio::fs::remove_dir_all(staged).await;
    };
    for dir in [target.parent(), retired.parent()].into_iter().flatten() {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            cleanup().await;
            return Err(e);
        }
    }

    let had_previous = match tokio::fs::rename(target, retired).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            cleanup().await;
            return Err(e);
        }
    };
    if let Err(e) = tokio::fs::rename(staged, target).await {
        if had_previous {
            let _ = tokio::fs::rename(retired, target).await;
        }
        cleanup().await;
        return Err(e);
    }
    if had_previous {
        if let Err(e) = tokio::fs::remove_dir_all(retired).await {
            tracing::warn!(path = %retired.display(), error = %e, "Failed to remove replaced directory");
        }
    }
    Ok(())
}

/// Write through a sibling temp file and rename over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// A relative path made only of normal components.
pub fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.chars().any(char::is_control)
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
