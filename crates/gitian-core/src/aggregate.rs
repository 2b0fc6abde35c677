//! Merging per-target outcomes and builder assertions into the final report.

use crate::build::{BuildResult, BuildStatus};
use crate::error::{
    BuildError, DescriptorError, ProvisionError, SigningError, StepError, StoreError,
};
use crate::manifest::Fingerprint;
use crate::repository::{ResultBundle, ResultsRepository};
use crate::request::{BuildRequest, Mode, Target};
use crate::sign::SignatureAssertion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Status of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every target succeeded.
    Success,
    /// At least one target did not fail, but not all succeeded.
    PartialSuccess,
    /// Every target failed.
    Failed,
}

impl PipelineStatus {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a TargetOutcome>) -> Self {
        let (mut total, mut succeeded, mut failed) = (0usize, 0usize, 0usize);
        for outcome in outcomes {
            total += 1;
            match outcome {
                TargetOutcome::Success => succeeded += 1,
                TargetOutcome::Failed { .. } => failed += 1,
                TargetOutcome::Skipped { .. } => {}
            }
        }
        if total > 0 && failed == total {
            Self::Failed
        } else if succeeded == total {
            Self::Success
        } else {
            Self::PartialSuccess
        }
    }
}

/// Why a target failed, in serialisable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    Provision { message: String },
    DescriptorNotFound { message: String },
    DescriptorValidation { message: String },
    /// The build ran but did not succeed.
    BuildFailed {
        status: BuildStatus,
        exit_code: Option<i32>,
    },
    /// The sandbox could not be driven.
    Sandbox { message: String },
    Signing { message: String },
    Storage { message: String },
    /// Builders disagree on the output of a target.
    Mismatch { fingerprints: usize },
    Cancelled,
    Internal { message: String },
}

impl FailureCause {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<&DescriptorError> for FailureCause {
    fn from(e: &DescriptorError) -> Self {
        let message = e.to_string();
        match e {
            DescriptorError::NotFound { .. } => Self::DescriptorNotFound { message },
            DescriptorError::Validation { .. } => Self::DescriptorValidation { message },
            DescriptorError::Source(_) => Self::Internal { message },
        }
    }
}

impl From<&ProvisionError> for FailureCause {
    fn from(e: &ProvisionError) -> Self {
        Self::Provision {
            message: e.to_string(),
        }
    }
}

impl From<&StoreError> for FailureCause {
    fn from(e: &StoreError) -> Self {
        Self::Storage {
            message: e.to_string(),
        }
    }
}

impl From<&StepError> for FailureCause {
    fn from(e: &StepError) -> Self {
        let message = e.to_string();
        match e {
            StepError::Provision(e) => e.into(),
            StepError::Build(BuildError::Store(e)) => e.into(),
            StepError::Build(_) => Self::Sandbox { message },
            StepError::Signing(SigningError::Backend(_)) => Self::Sandbox { message },
            StepError::Signing(_) => Self::Signing { message },
            StepError::Cancelled => Self::Cancelled,
            StepError::Panicked(_) => Self::Internal { message },
        }
    }
}

/// Terminal outcome of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Success,
    Failed { cause: FailureCause },
    Skipped { reason: String },
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Cross-builder agreement on a target's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verification {
    /// Every builder reported the same fingerprint.
    Consensus { fingerprint: Fingerprint },
    /// Builders disagree; each fingerprint maps to the builders reporting it.
    Mismatch {
        fingerprints: BTreeMap<Fingerprint, Vec<String>>,
    },
    /// No assertion exists yet.
    Unverified,
}

impl Verification {
    pub fn from_assertions(assertions: &[SignatureAssertion]) -> Self {
        let mut fingerprints: BTreeMap<Fingerprint, Vec<String>> = BTreeMap::new();
        for assertion in assertions {
            fingerprints
                .entry(assertion.fingerprint.clone())
                .or_default()
                .push(assertion.builder.clone());
        }
        if fingerprints.len() > 1 {
            return Self::Mismatch { fingerprints };
        }
        match fingerprints.into_keys().next() {
            Some(fingerprint) => Self::Consensus { fingerprint },
            None => Self::Unverified,
        }
    }
}

/// What happened to a target's results in the results repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitStatus {
    NotRequested,
    Skipped { reason: String },
    Committed { path: PathBuf },
    Failed { message: String },
}

/// Report entry of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub outcome: TargetOutcome,
    pub build: Option<BuildResult>,
    /// Historical and current assertions, one per builder.
    pub assertions: Vec<SignatureAssertion>,
    pub verification: Verification,
    pub commit: CommitStatus,
}

impl TargetReport {
    /// `Some(true)` on consensus, `Some(false)` on mismatch, `None` when
    /// unverified.
    pub fn consensus(&self) -> Option<bool> {
        match self.verification {
            Verification::Consensus { .. } => Some(true),
            Verification::Mismatch { .. } => Some(false),
            Verification::Unverified => None,
        }
    }
}

/// Final view of a pipeline run over every requested target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub version: String,
    pub builder: String,
    pub mode: Mode,
    pub targets: BTreeMap<Target, TargetReport>,
    pub status: PipelineStatus,
    pub cancelled: bool,
}

impl AggregateReport {
    pub fn target(&self, target: Target) -> Option<&TargetReport> {
        self.targets.get(&target)
    }

    pub fn consensus(&self, target: Target) -> Option<bool> {
        self.target(target).and_then(TargetReport::consensus)
    }
}

/// What a worker hands to the aggregator for one target.
#[derive(Debug, Clone)]
pub struct TargetRecord {
    pub outcome: TargetOutcome,
    pub build: Option<BuildResult>,
    pub assertion: Option<SignatureAssertion>,
}

impl TargetRecord {
    pub fn success(build: Option<BuildResult>, assertion: Option<SignatureAssertion>) -> Self {
        Self {
            outcome: TargetOutcome::Success,
            build,
            assertion,
        }
    }

    pub fn failed(cause: FailureCause) -> Self {
        Self {
            outcome: TargetOutcome::Failed { cause },
            build: None,
            assertion: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            outcome: TargetOutcome::Skipped {
                reason: reason.into(),
            },
            build: None,
            assertion: None,
        }
    }

    pub fn with_build(mut self, build: BuildResult) -> Self {
        self.build = Some(build);
        self
    }
}

/// Builds the [`AggregateReport`] and optionally commits results.
pub struct ResultAggregator {
    repository: Arc<dyn ResultsRepository>,
}

impl ResultAggregator {
    pub fn new(repository: Arc<dyn ResultsRepository>) -> Self {
        Self { repository }
    }

    /// Aggregate `records` for `request`.
    ///
    /// Mismatching fingerprints are reported, never raised. Repository
    /// failures end up in the affected target's [`CommitStatus`].
    pub async fn aggregate(
        &self,
        request: &BuildRequest,
        records: BTreeMap<Target, TargetRecord>,
        cancelled: bool,
    ) -> AggregateReport {
        let version = request.version();
        let mut targets = BTreeMap::new();
        let mut appended: Vec<(Target, PathBuf)> = Vec::new();

        for (target, record) in records {
            let mut assertions = match self.repository.load_assertions(version, target).await {
                Ok(assertions) => assertions,
                Err(e) => {
                    tracing::warn!(os = %target, error = %e, "Failed to load recorded assertions");
                    Vec::new()
                }
            };
            if let Some(current) = &record.assertion {
                assertions.retain(|a| a.builder != current.builder);
                assertions.push(current.clone());
                assertions.sort_by(|a, b| a.builder.cmp(&b.builder));
            }
            let verification = Verification::from_assertions(&assertions);
            if let Verification::Mismatch { fingerprints } = &verification {
                tracing::warn!(
                    os = %target,
                    distinct = fingerprints.len(),
                    "Builders disagree on output fingerprint"
                );
            }

            let commit = match skip_commit(request, &record, cancelled) {
                Some(status) => status,
                None => self.append(request, target, &record, &mut appended).await,
            };

            targets.insert(
                target,
                TargetReport {
                    outcome: record.outcome,
                    build: record.build,
                    assertions,
                    verification,
                    commit,
                },
            );
        }

        if !appended.is_empty() {
            let paths: Vec<PathBuf> = appended.iter().map(|(_, p)| p.clone()).collect();
            let message = format!("Add {} sigs for {}", version, request.builder_identity());
            if let Err(e) = self.repository.commit(&paths, &message).await {
                tracing::error!(error = %e, "Failed to commit results");
                for (target, _) in &appended {
                    if let Some(report) = targets.get_mut(target) {
                        report.commit = CommitStatus::Failed {
                            message: e.to_string(),
                        };
                    }
                }
            }
        }

        report(request, targets, cancelled)
    }

    /// Verify what the repository already holds for every requested target,
    /// without building or signing anything.
    ///
    /// A target succeeds on consensus, fails on a mismatch and is skipped
    /// when no builder filed an assertion yet. Nothing is committed.
    pub async fn verify(&self, request: &BuildRequest) -> AggregateReport {
        let version = request.version();
        let mut targets = BTreeMap::new();
        for target in request.targets() {
            let (outcome, assertions) = match self.repository.load_assertions(version, target).await {
                Ok(assertions) => (None, assertions),
                Err(e) => {
                    tracing::error!(os = %target, error = %e, "Failed to load recorded assertions");
                    let cause = FailureCause::Storage {
                        message: e.to_string(),
                    };
                    (Some(TargetOutcome::Failed { cause }), Vec::new())
                }
            };
            let verification = Verification::from_assertions(&assertions);
            let outcome = outcome.unwrap_or_else(|| match &verification {
                Verification::Consensus { fingerprint } => {
                    tracing::info!(os = %target, fingerprint = fingerprint.short(), builders = assertions.len(), "Verified");
                    TargetOutcome::Success
                }
                Verification::Mismatch { fingerprints } => {
                    tracing::warn!(os = %target, distinct = fingerprints.len(), "Verification failed");
                    TargetOutcome::Failed {
                        cause: FailureCause::Mismatch {
                            fingerprints: fingerprints.len(),
                        },
                    }
                }
                Verification::Unverified => TargetOutcome::Skipped {
                    reason: format!("no assertions recorded for {version}"),
                },
            });

            targets.insert(
                target,
                TargetReport {
                    outcome,
                    build: None,
                    assertions,
                    verification,
                    commit: CommitStatus::NotRequested,
                },
            );
        }
        report(request, targets, false)
    }

    async fn append(
        &self,
        request: &BuildRequest,
        target: Target,
        record: &TargetRecord,
        appended: &mut Vec<(Target, PathBuf)>,
    ) -> CommitStatus {
        let Some(bundle) = bundle(request, target, record) else {
            return CommitStatus::Skipped {
                reason: "no successful build result".into(),
            };
        };
        match self.repository.append(&bundle).await {
            Ok(path) => {
                appended.push((target, path.clone()));
                CommitStatus::Committed { path }
            }
            Err(e) => {
                tracing::error!(os = %target, error = %e, "Failed to append results");
                CommitStatus::Failed {
                    message: e.to_string(),
                }
            }
        }
    }
}

fn report(
    request: &BuildRequest,
    targets: BTreeMap<Target, TargetReport>,
    cancelled: bool,
) -> AggregateReport {
    let status = PipelineStatus::from_outcomes(targets.values().map(|r| &r.outcome));
    tracing::info!(
        version = request.version(),
        builder = request.builder_identity(),
        status = ?status,
        targets = targets.len(),
        cancelled,
        "Pipeline aggregated"
    );

    AggregateReport {
        version: request.version().to_string(),
        builder: request.builder_identity().to_string(),
        mode: request.mode(),
        targets,
        status,
        cancelled,
    }
}

/// Why `record` is not appended to the repository, if it is not.
fn skip_commit(request: &BuildRequest, record: &TargetRecord, cancelled: bool) -> Option<CommitStatus> {
    let skipped = |reason: &str| {
        Some(CommitStatus::Skipped {
            reason: reason.to_string(),
        })
    };
    if !request.commit_results() {
        Some(CommitStatus::NotRequested)
    } else if cancelled {
        skipped("pipeline cancelled")
    } else if request.detach_sign() {
        skipped("detached signing")
    } else if !record.outcome.is_success() {
        skipped("target did not succeed")
    } else {
        None
    }
}

fn bundle(request: &BuildRequest, target: Target, record: &TargetRecord) -> Option<ResultBundle> {
    let build = record.build.as_ref().filter(|b| b.is_success())?;
    Some(ResultBundle {
        version: request.version().to_string(),
        target,
        builder: request.builder_identity().to_string(),
        fingerprint: build.fingerprint.clone()?,
        manifest: build.manifest(),
        assertion: record.assertion.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn assertion(builder: &str, fingerprint: &str) -> SignatureAssertion {
        SignatureAssertion {
            version: "0.21.2".into(),
            target: Target::Linux,
            builder: builder.into(),
            fingerprint: Fingerprint::from(fingerprint.to_string()),
            release: "0.21.2-linux".into(),
            assert_name: "litecoin-linux-0.21-build.assert".into(),
            assert_document: String::new(),
            signature: Vec::new(),
            detached: true,
            signed_at: Utc::now(),
        }
    }

    fn failed() -> TargetOutcome {
        TargetOutcome::Failed {
            cause: FailureCause::Cancelled,
        }
    }

    #[test]
    fn test_pipeline_status() {
        let skipped = TargetOutcome::Skipped { reason: "x".into() };
        assert_eq!(
            PipelineStatus::from_outcomes(&[TargetOutcome::Success, TargetOutcome::Success]),
            PipelineStatus::Success
        );
        assert_eq!(
            PipelineStatus::from_outcomes(&[TargetOutcome::Success, failed()]),
            PipelineStatus::PartialSuccess
        );
        assert_eq!(
            PipelineStatus::from_outcomes(&[failed(), failed()]),
            PipelineStatus::Failed
        );
        assert_eq!(
            PipelineStatus::from_outcomes(&[failed(), skipped]),
            PipelineStatus::PartialSuccess
        );
    }

    #[test]
    fn test_verification() {
        assert_eq!(Verification::from_assertions(&[]), Verification::Unverified);

        let agree = [assertion("alice", "f1"), assertion("bob", "f1")];
        assert_eq!(
            Verification::from_assertions(&agree),
            Verification::Consensus {
                fingerprint: Fingerprint::from("f1".to_string())
            }
        );

        let outlier = [
            assertion("alice", "f1"),
            assertion("bob", "f1"),
            assertion("carol", "f2"),
        ];
        match Verification::from_assertions(&outlier) {
            Verification::Mismatch { fingerprints } => {
                assert_eq!(fingerprints.len(), 2);
                assert_eq!(fingerprints[&Fingerprint::from("f2".to_string())], vec!["carol"]);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_cause_mapping() {
        let err = DescriptorError::Validation {
            file: "gitian-osx.yml".into(),
            message: "bad pin".into(),
        };
        assert!(matches!(
            FailureCause::from(&err),
            FailureCause::DescriptorValidation { .. }
        ));
        assert_eq!(FailureCause::from(&StepError::Cancelled), FailureCause::Cancelled);
        let signing = StepError::Signing(SigningError::Failed { exit_code: 2 });
        assert!(matches!(FailureCause::from(&signing), FailureCause::Signing { .. }));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = TargetOutcome::Failed {
            cause: FailureCause::BuildFailed {
                status: BuildStatus::Failed,
                exit_code: Some(2),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["cause"]["kind"], "build_failed");
        assert_eq!(json["cause"]["exit_code"], 2);
    }
}
