//! The top-level state machine driving a release build.
//!
//! ```text
//! Idle ──▶ Setup ──▶ Running ──────────────────────────▶ Aggregated ──▶ Done
//!            │          │  per target, up to N at once       ▲
//!            │          ├─ Building ─▶ Signing ─▶ terminal ──┤
//!            │          └─ (sign-only) Signing ─▶ terminal ──┤
//!            └─ failed setup ─▶ terminal ────────────────────┘
//! ```
//!
//! A target that fails never stops the others. Aggregation runs exactly
//! once, after every requested target reached a terminal outcome.
//!
//! [`Mode::Verify`] goes straight from `Idle` to `Running` and only reads
//! the results repository.

use crate::aggregate::{AggregateReport, FailureCause, ResultAggregator, TargetOutcome, TargetRecord};
use crate::build::{BuildResult, BuildRunner};
use crate::config::PipelineConfig;
use crate::descriptor::{Descriptor, DescriptorResolver, DescriptorSource, DirectorySource};
use crate::error::{PipelineError, StepError};
use crate::log::{LogSink, StepLog, TracingLogSink};
use crate::provisioner::{panic_message, ImageSlot, SandboxProvisioner};
use crate::repository::{ResultsRepository, SigsRepository};
use crate::request::{BuildRequest, Mode, Target};
use crate::sign::{SignRunner, SigningIdentity};
use crate::store::BuildResultStore;
use futures::future::join_all;
use futures::FutureExt;
use gitian_sandbox::{ResourceLimits, SandboxBackend};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Phase of the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Setup,
    Running,
    Aggregated,
    Done,
}

/// Phase of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Setup,
    Building,
    Signing,
    Succeeded,
    Failed,
    Skipped,
}

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl From<&TargetOutcome> for TargetState {
    fn from(outcome: &TargetOutcome) -> Self {
        match outcome {
            TargetOutcome::Success => Self::Succeeded,
            TargetOutcome::Failed { .. } => Self::Failed,
            TargetOutcome::Skipped { .. } => Self::Skipped,
        }
    }
}

/// Observable progress of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub targets: BTreeMap<Target, TargetState>,
}

/// Collaborators a pipeline runs against.
///
/// [`PipelineContext::new`] wires the defaults below the config's work
/// directory; each collaborator can be replaced with a `with_*` method.
#[derive(Clone)]
pub struct PipelineContext {
    config: PipelineConfig,
    provisioner: Arc<SandboxProvisioner>,
    descriptors: Arc<dyn DescriptorSource>,
    repository: Arc<dyn ResultsRepository>,
    store: Arc<BuildResultStore>,
    log_sink: Arc<dyn LogSink>,
    signing: SigningIdentity,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn SandboxBackend>,
        signing: SigningIdentity,
    ) -> Self {
        let provisioner = Arc::new(SandboxProvisioner::new(
            backend,
            config.image_version.clone(),
            config.provision_retry_backoff,
            config.destroy_timeout,
        ));
        Self {
            descriptors: Arc::new(DirectorySource::new(config.descriptors_dir())),
            repository: Arc::new(SigsRepository::new(config.sigs_dir()).with_git(config.git_commit)),
            store: Arc::new(BuildResultStore::new(config.results_dir(), config.binaries_dir())),
            log_sink: Arc::new(TracingLogSink),
            provisioner,
            signing,
            config,
        }
    }

    /// Share a provisioner, and its image cache, with other pipelines.
    pub fn with_provisioner(mut self, provisioner: Arc<SandboxProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_descriptors(mut self, descriptors: Arc<dyn DescriptorSource>) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn ResultsRepository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Arc<SandboxProvisioner> {
        &self.provisioner
    }

    pub fn store(&self) -> &Arc<BuildResultStore> {
        &self.store
    }
}

/// Everything a target worker reads; nothing in here is mutated by workers
/// except the progress channel.
struct Shared {
    request: BuildRequest,
    provisioner: Arc<SandboxProvisioner>,
    store: Arc<BuildResultStore>,
    builds: BuildRunner,
    signs: SignRunner,
    identity: SigningIdentity,
    status: Arc<watch::Sender<PipelineSnapshot>>,
}

impl Shared {
    fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.request.threads(), self.request.memory_mb())
    }

    fn set_target(&self, target: Target, state: TargetState) {
        self.status.send_modify(|snapshot| {
            snapshot.targets.insert(target, state);
        });
    }
}

/// Runs one [`BuildRequest`] to an [`AggregateReport`].
pub struct PipelineController {
    request: BuildRequest,
    context: PipelineContext,
    status: Arc<watch::Sender<PipelineSnapshot>>,
}

impl PipelineController {
    /// Create a controller in the `Idle` state.
    pub fn new(request: BuildRequest, context: PipelineContext) -> Self {
        let snapshot = PipelineSnapshot {
            state: PipelineState::Idle,
            targets: request
                .targets()
                .into_iter()
                .map(|t| (t, TargetState::Pending))
                .collect(),
        };
        let (status, _) = watch::channel(snapshot);
        Self {
            request,
            context,
            status: Arc::new(status),
        }
    }

    pub fn request(&self) -> &BuildRequest {
        &self.request
    }

    /// Watch the progress of the run.
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.status.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        tracing::debug!(?state, "Pipeline state");
        self.status.send_modify(|snapshot| snapshot.state = state);
    }

    /// Run the pipeline to completion.
    ///
    /// Per-target failures are part of the report. Only an invalid
    /// configuration or a cancelled run is returned as an error; a
    /// cancelled run still carries the full report.
    pub async fn run(self, cancel: CancellationToken) -> Result<AggregateReport, PipelineError> {
        self.context.config.validate()?;

        let request = self.request.clone();
        let targets = request.targets();
        let mode = request.mode();
        let started = Instant::now();
        tracing::info!(
            version = request.version(),
            builder = request.builder_identity(),
            %mode,
            targets = ?targets,
            threads = request.threads(),
            memory_mb = request.memory_mb(),
            "Starting pipeline"
        );

        if mode == Mode::Verify {
            return Ok(self.verify().await);
        }

        let identity = if request.detach_sign() {
            SigningIdentity::detached(self.context.signing.signer.clone())
        } else {
            self.context.signing.clone()
        };
        let step_log = StepLog::new(Arc::clone(&self.context.log_sink), self.context.config.logs_dir());
        let shared = Arc::new(Shared {
            builds: BuildRunner::new(
                Arc::clone(&self.context.store),
                step_log.clone(),
                self.context.config.inputs_dir(),
                request.builder_identity(),
            )
            .with_source_url(request.source_url().map(str::to_string)),
            signs: SignRunner::new(step_log),
            provisioner: Arc::clone(&self.context.provisioner),
            store: Arc::clone(&self.context.store),
            identity,
            status: Arc::clone(&self.status),
            request: request.clone(),
        });

        self.set_state(PipelineState::Setup);
        let mut records: BTreeMap<Target, TargetRecord> = BTreeMap::new();
        let mut ready = Vec::new();
        for (target, setup) in self.setup(&targets, &cancel).await {
            match setup {
                Ok(descriptor) => ready.push((target, descriptor)),
                Err(cause) => {
                    tracing::error!(os = %target, cause = ?cause, "Setup failed");
                    shared.set_target(target, TargetState::Failed);
                    records.insert(target, TargetRecord::failed(cause));
                }
            }
        }

        self.set_state(PipelineState::Running);
        if mode == Mode::Setup {
            for (target, _) in ready {
                shared.set_target(target, TargetState::Succeeded);
                records.insert(target, TargetRecord::success(None, None));
            }
        } else {
            self.run_workers(&shared, ready, &cancel, &mut records).await;
        }

        let cancelled = cancel.is_cancelled();
        for target in &targets {
            records.entry(*target).or_insert_with(|| {
                shared.set_target(*target, TargetState::Failed);
                TargetRecord::failed(if cancelled {
                    FailureCause::Cancelled
                } else {
                    FailureCause::internal("worker ended without a result")
                })
            });
        }

        let aggregator = ResultAggregator::new(Arc::clone(&self.context.repository));
        let report = aggregator.aggregate(&request, records, cancelled).await;
        self.set_state(PipelineState::Aggregated);

        let stats = self.context.provisioner.stats();
        tracing::info!(
            status = ?report.status,
            cancelled,
            sandboxes = stats.provisioned(),
            destroyed = stats.destroyed(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );
        self.set_state(PipelineState::Done);

        if cancelled {
            Err(PipelineError::Cancelled(Box::new(report)))
        } else {
            Ok(report)
        }
    }

    /// Cross-check the results repository; no sandbox is involved.
    async fn verify(&self) -> AggregateReport {
        self.set_state(PipelineState::Running);
        let aggregator = ResultAggregator::new(Arc::clone(&self.context.repository));
        let report = aggregator.verify(&self.request).await;
        self.status.send_modify(|snapshot| {
            for (target, entry) in &report.targets {
                snapshot.targets.insert(*target, TargetState::from(&entry.outcome));
            }
        });
        self.set_state(PipelineState::Aggregated);
        self.set_state(PipelineState::Done);
        report
    }

    /// Prepare every target concurrently. A target's error never affects
    /// another target.
    async fn setup(
        &self,
        targets: &BTreeSet<Target>,
        cancel: &CancellationToken,
    ) -> BTreeMap<Target, Result<Option<Descriptor>, FailureCause>> {
        let mode = self.request.mode();
        let apt_cacher = self.request.apt_cacher();
        let provisioner = &self.context.provisioner;
        let resolver = DescriptorResolver::new(Arc::clone(&self.context.descriptors));

        let toolchain = async {
            if !mode.includes_sign() {
                return Ok(());
            }
            let base = self.context.config.base_image(apt_cacher);
            provisioner
                .ensure_image(ImageSlot::Toolchain, &base)
                .await
                .map(|_| ())
                .map_err(|e| {
                    tracing::error!(error = %e, "Toolchain image unavailable");
                    FailureCause::from(&e)
                })
        };
        let per_target = join_all(targets.iter().map(|&target| {
            let resolver = resolver.clone();
            async move {
                self.status.send_modify(|s| {
                    s.targets.insert(target, TargetState::Setup);
                });
                (target, self.setup_target(&resolver, target).await)
            }
        }));

        let work = async { tokio::join!(toolchain, per_target) };
        let (toolchain, per_target) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("Cancelled during setup");
                return targets.iter().map(|&t| (t, Err(FailureCause::Cancelled))).collect();
            }
            done = work => done,
        };

        per_target
            .into_iter()
            .map(|(target, setup)| {
                let setup = match (setup, &toolchain) {
                    (Ok(descriptor), Ok(())) => Ok(descriptor),
                    (Ok(_), Err(cause)) => Err(cause.clone()),
                    (Err(cause), _) => Err(cause),
                };
                (target, setup)
            })
            .collect()
    }

    async fn setup_target(
        &self,
        resolver: &DescriptorResolver,
        target: Target,
    ) -> Result<Option<Descriptor>, FailureCause> {
        let request = &self.request;
        let apt_cacher = request.apt_cacher();
        let provisioner = &self.context.provisioner;

        match request.mode() {
            Mode::Setup => {
                let base = self.context.config.base_image(apt_cacher);
                provisioner
                    .ensure_image(ImageSlot::Target(target), &base)
                    .await
                    .map_err(|e| FailureCause::from(&e))?;
                Ok(None)
            }
            mode if mode.includes_build() => {
                let descriptor = resolver
                    .resolve(request.version(), request.source(), target)
                    .await
                    .map_err(|e| {
                        tracing::error!(os = %target, error = %e, "Descriptor unusable");
                        FailureCause::from(&e)
                    })?;
                provisioner
                    .ensure_image(ImageSlot::Target(target), &descriptor.base_image(apt_cacher))
                    .await
                    .map_err(|e| FailureCause::from(&e))?;
                Ok(Some(descriptor))
            }
            _ => Ok(None),
        }
    }

    /// Run one worker per ready target and collect their records.
    async fn run_workers(
        &self,
        shared: &Arc<Shared>,
        ready: Vec<(Target, Option<Descriptor>)>,
        cancel: &CancellationToken,
        records: &mut BTreeMap<Target, TargetRecord>,
    ) {
        let admission = Arc::new(Semaphore::new(self.context.config.max_concurrent_targets));
        let mut workers = JoinSet::new();
        for (target, descriptor) in ready {
            let worker = Worker {
                shared: Arc::clone(shared),
                target,
                descriptor,
                cancel: cancel.clone(),
                admission: Arc::clone(&admission),
            };
            workers.spawn(worker.run());
        }

        let grace = self.context.config.cancel_grace;
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((target, record))) => {
                        shared.set_target(target, TargetState::from(&record.outcome));
                        records.insert(target, record);
                    }
                    Some(Err(e)) => tracing::error!(error = %e, "Target worker failed"),
                    None => break,
                },
                _ = cancel.cancelled(), if deadline.is_none() => {
                    tracing::warn!(
                        in_flight = workers.len(),
                        grace_ms = grace.as_millis() as u64,
                        "Cancellation requested, waiting for sandboxes to be torn down"
                    );
                    deadline = Some(Instant::now() + grace);
                }
                _ = expired(deadline) => {
                    tracing::error!(in_flight = workers.len(), "Grace period over, aborting workers");
                    workers.abort_all();
                    while let Some(joined) = workers.join_next().await {
                        if let Ok((target, record)) = joined {
                            records.insert(target, record);
                        }
                    }
                    break;
                }
            }
        }
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drives one target through Build and Sign.
struct Worker {
    shared: Arc<Shared>,
    target: Target,
    descriptor: Option<Descriptor>,
    cancel: CancellationToken,
    admission: Arc<Semaphore>,
}

impl Worker {
    async fn run(self) -> (Target, TargetRecord) {
        let target = self.target;
        let record = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(record) => record,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(os = %target, panic = %message, "Target worker panicked");
                TargetRecord::failed(FailureCause::internal(message))
            }
        };
        tracing::info!(os = %target, outcome = ?record.outcome, "Target finished");
        (target, record)
    }

    async fn execute(self) -> TargetRecord {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return TargetRecord::failed(FailureCause::Cancelled),
            permit = Arc::clone(&self.admission).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return TargetRecord::failed(FailureCause::internal("admission closed")),
            },
        };

        let mode = self.shared.request.mode();
        let build = if mode.includes_build() {
            match self.build().await {
                Ok(build) => build,
                Err(record) => return record,
            }
        } else {
            match self.stored_build().await {
                Ok(build) => build,
                Err(record) => return record,
            }
        };

        if !mode.includes_sign() {
            return TargetRecord::success(Some(build), None);
        }
        self.sign(build).await
    }

    async fn build(&self) -> Result<BuildResult, TargetRecord> {
        let shared = &self.shared;
        let target = self.target;
        let descriptor = self
            .descriptor
            .clone()
            .ok_or_else(|| TargetRecord::failed(FailureCause::internal("no descriptor resolved")))?;
        shared.set_target(target, TargetState::Building);

        let runner = shared.builds.clone();
        let (threads, memory_mb) = (shared.request.threads(), shared.request.memory_mb());
        let build = shared
            .provisioner
            .with_sandbox(
                ImageSlot::Target(target),
                shared.limits(),
                &[],
                &self.cancel,
                |sandbox| async move {
                    Ok::<_, StepError>(runner.run(&descriptor, &sandbox, threads, memory_mb).await?)
                },
            )
            .await
            .map_err(|e| TargetRecord::failed(FailureCause::from(&e)))?;

        if !build.is_success() {
            let cause = FailureCause::BuildFailed {
                status: build.status,
                exit_code: build.exit_code,
            };
            return Err(TargetRecord::failed(cause).with_build(build));
        }
        if let Err(e) = shared.store.save(&build).await {
            tracing::error!(os = %target, error = %e, "Failed to persist build result");
            return Err(TargetRecord::failed(FailureCause::from(&e)).with_build(build));
        }
        Ok(build)
    }

    /// The persisted result of an earlier build, for sign-only runs.
    async fn stored_build(&self) -> Result<BuildResult, TargetRecord> {
        let version = self.shared.request.version();
        match self.shared.store.load(version, self.target).await {
            Ok(Some(build)) if build.is_success() => {
                tracing::info!(os = %self.target, fingerprint = ?build.fingerprint, "Resuming from stored build");
                Ok(build)
            }
            Ok(_) => {
                tracing::warn!(os = %self.target, version, "No successful stored build, skipping");
                Err(TargetRecord::skipped(format!(
                    "no successful build result stored for {version}"
                )))
            }
            Err(e) => Err(TargetRecord::failed(FailureCause::from(&e))),
        }
    }

    async fn sign(&self, build: BuildResult) -> TargetRecord {
        let shared = &self.shared;
        shared.set_target(self.target, TargetState::Signing);

        let signer = shared.signs.clone();
        let identity = shared.identity.clone();
        let mounts = identity.mounts();
        let unsigned = build.clone();
        let signed = shared
            .provisioner
            .with_sandbox(
                ImageSlot::Toolchain,
                shared.limits(),
                &mounts,
                &self.cancel,
                |sandbox| async move {
                    Ok::<_, StepError>(signer.run(&unsigned, &sandbox, &identity).await?)
                },
            )
            .await;

        match signed {
            Ok(assertion) => TargetRecord::success(Some(build), Some(assertion)),
            Err(e) => {
                tracing::error!(os = %self.target, error = %e, "Signing failed");
                TargetRecord::failed(FailureCause::from(&e)).with_build(build)
            }
        }
    }
}
