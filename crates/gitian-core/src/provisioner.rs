//! Sandbox provisioning with a process-wide base image cache.
//!
//! # Lifecycle
//!
//! ```text
//! Setup:   ensure_image(slot) ──▶ image cache (slot, base, version) ──▶ backend.create_image
//! Steps:   with_sandbox(slot, ..., f)
//!            ├─ provision (one retry when the backend is unavailable)
//!            ├─ f(sandbox)      raced against cancellation, panics caught
//!            └─ destroy         exactly once, bounded by destroy_timeout
//! ```

use crate::error::{ProvisionError, StepError};
use crate::request::Target;
use bytes::Bytes;
use futures::FutureExt;
use gitian_sandbox::{
    BackendError, ImageSpec, Mount, OutputSender, ResourceLimits, SandboxBackend, SandboxCommand,
    SandboxHandle, SandboxId,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

/// Which base image a sandbox is started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSlot {
    /// Build image of one target.
    Target(Target),
    /// Shared image of signing sandboxes.
    Toolchain,
}

impl ImageSlot {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Target(target) => target.as_str(),
            Self::Toolchain => "toolchain",
        }
    }
}

impl fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Distribution a base image is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub distro: String,
    pub suite: String,
    pub arch: String,
    pub apt_cacher: bool,
}

/// Provisioner statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct ProvisionerStats {
    /// Sandboxes handed out.
    pub provisioned: AtomicU64,
    /// Teardowns performed, successful or not.
    pub destroyed: AtomicU64,
    /// Base images built by the backend.
    pub images_built: AtomicU64,
    /// `ensure_image` calls answered from the cache.
    pub image_cache_hits: AtomicU64,
    /// Provisioning attempts repeated after a transient failure.
    pub retries: AtomicU64,
}

impl ProvisionerStats {
    pub fn provisioned(&self) -> u64 {
        self.provisioned.load(Ordering::Relaxed)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn images_built(&self) -> u64 {
        self.images_built.load(Ordering::Relaxed)
    }

    pub fn image_cache_hits(&self) -> u64 {
        self.image_cache_hits.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// A live sandbox, exclusively owned by the step that provisioned it.
pub struct Sandbox {
    handle: SandboxHandle,
    limits: ResourceLimits,
    backend: Arc<dyn SandboxBackend>,
}

impl Sandbox {
    pub fn id(&self) -> SandboxId {
        self.handle.id
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Run a command, streaming its output. Returns the exit code.
    pub async fn run(
        &self,
        command: &SandboxCommand,
        output: OutputSender,
    ) -> Result<i32, BackendError> {
        tracing::debug!(sandbox_id = %self.handle.id, argv = ?command.argv(), "Running in sandbox");
        self.backend
            .run(&self.handle, command, &self.limits, output)
            .await
    }

    pub async fn copy_in(&self, path: &str, contents: &[u8]) -> Result<(), BackendError> {
        self.backend.copy_in(&self.handle, path, contents).await
    }

    pub async fn copy_out(&self, path: &str) -> Result<Bytes, BackendError> {
        self.backend.copy_out(&self.handle, path).await
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("handle", &self.handle)
            .field("limits", &self.limits)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Creates and tears down sandboxes, building base images on first use.
///
/// One provisioner is created per process and shared through an `Arc`; its
/// image cache is the only place that decides whether a base image still
/// has to be built.
pub struct SandboxProvisioner {
    backend: Arc<dyn SandboxBackend>,
    /// Keyed by the full image description, so a different base for the
    /// same slot is a different image.
    images: Mutex<HashMap<ImageSpec, Arc<OnceCell<ImageSpec>>>>,
    /// Image most recently made ready for each slot.
    registered: Mutex<HashMap<ImageSlot, ImageSpec>>,
    image_version: String,
    retry_backoff: Duration,
    destroy_timeout: Duration,
    stats: Arc<ProvisionerStats>,
}

impl SandboxProvisioner {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        image_version: impl Into<String>,
        retry_backoff: Duration,
        destroy_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            images: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            image_version: image_version.into(),
            retry_backoff,
            destroy_timeout,
            stats: Arc::new(ProvisionerStats::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn stats(&self) -> &ProvisionerStats {
        &self.stats
    }

    /// Make sure the base image for `slot` exists, building it if needed,
    /// and make it the image [`provision`](Self::provision) uses for `slot`.
    ///
    /// Concurrent callers for the same slot and base share one build. A
    /// failed build is not cached; the next call tries again.
    pub async fn ensure_image(
        &self,
        slot: ImageSlot,
        base: &BaseImage,
    ) -> Result<ImageSpec, ProvisionError> {
        let spec = ImageSpec {
            label: slot.label().to_string(),
            distro: base.distro.clone(),
            suite: base.suite.clone(),
            arch: base.arch.clone(),
            version: self.image_version.clone(),
            apt_cacher: base.apt_cacher,
        };
        let cell = {
            let mut images = self.images.lock().await;
            Arc::clone(
                images
                    .entry(spec.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        if let Some(ready) = cell.get() {
            self.stats.image_cache_hits.fetch_add(1, Ordering::Relaxed);
            self.register(slot, ready).await;
            return Ok(ready.clone());
        }

        let ready = cell
            .get_or_try_init(|| async {
                let image_error = |source: BackendError| ProvisionError::Image {
                    image: spec.tag(),
                    source,
                };
                if self.backend.image_exists(&spec).await.map_err(image_error)? {
                    tracing::info!(image = %spec.tag(), "Base image present");
                } else {
                    tracing::info!(image = %spec.tag(), backend = self.backend.name(), "Building base image");
                    self.backend.create_image(&spec).await.map_err(image_error)?;
                    self.stats.images_built.fetch_add(1, Ordering::Relaxed);
                }
                Ok::<_, ProvisionError>(spec.clone())
            })
            .await?;
        self.register(slot, ready).await;
        Ok(ready.clone())
    }

    async fn register(&self, slot: ImageSlot, spec: &ImageSpec) {
        self.registered.lock().await.insert(slot, spec.clone());
    }

    /// Image registered for `slot`, if Setup produced one.
    async fn registered_image(&self, slot: ImageSlot) -> Option<ImageSpec> {
        self.registered.lock().await.get(&slot).cloned()
    }

    /// Start a sandbox from the image registered for `slot`.
    pub async fn provision(
        &self,
        slot: ImageSlot,
        limits: ResourceLimits,
        mounts: &[Mount],
    ) -> Result<Sandbox, ProvisionError> {
        let image = self
            .registered_image(slot)
            .await
            .ok_or_else(|| ProvisionError::MissingImage(slot.to_string()))?;

        let handle = match self.backend.create(&image, &limits, mounts).await {
            Ok(handle) => handle,
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    %slot,
                    error = %e,
                    backoff_ms = self.retry_backoff.as_millis() as u64,
                    "Sandbox unavailable, retrying once"
                );
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.retry_backoff).await;
                self.backend
                    .create(&image, &limits, mounts)
                    .await
                    .map_err(classify)?
            }
            Err(e) => return Err(classify(e)),
        };

        self.stats.provisioned.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            %slot,
            sandbox_id = %handle.id,
            threads = limits.threads,
            memory_mb = limits.memory_mb,
            "Sandbox provisioned"
        );
        Ok(Sandbox {
            handle,
            limits,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Destroy a sandbox. Failures are logged; destroy is idempotent on the
    /// backend side, so nothing is left to retry here.
    pub async fn destroy(&self, sandbox: Sandbox) {
        destroy_bounded(
            Arc::clone(&self.backend),
            sandbox.handle,
            Arc::clone(&self.stats),
            self.destroy_timeout,
        )
        .await;
    }

    /// Provision a sandbox, hand it to `f`, and destroy it afterwards.
    ///
    /// The sandbox is destroyed exactly once whether `f` succeeds, fails,
    /// panics or is cut short by `cancel`. If the whole future is dropped
    /// mid-step, teardown is spawned onto the runtime instead.
    pub async fn with_sandbox<T, F, Fut>(
        &self,
        slot: ImageSlot,
        limits: ResourceLimits,
        mounts: &[Mount],
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, StepError>
    where
        F: FnOnce(Sandbox) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let sandbox = self.provision(slot, limits, mounts).await?;

        let guard = Teardown {
            backend: Arc::clone(&self.backend),
            handle: Some(sandbox.handle.clone()),
            stats: Arc::clone(&self.stats),
            timeout: self.destroy_timeout,
        };
        let sandbox_id = sandbox.id();

        let work = AssertUnwindSafe(async move { f(sandbox).await }).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(%slot, %sandbox_id, "Step cancelled, tearing down sandbox");
                Err(StepError::Cancelled)
            }
            result = work => match result {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(%slot, %sandbox_id, panic = %message, "Step panicked");
                    Err(StepError::Panicked(message))
                }
            },
        };

        guard.run().await;
        outcome
    }
}

fn classify(error: BackendError) -> ProvisionError {
    match error {
        BackendError::Unavailable(message) => ProvisionError::Unavailable(message),
        BackendError::ImageMissing(image) => ProvisionError::MissingImage(image),
        other => ProvisionError::Backend(other),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn destroy_bounded(
    backend: Arc<dyn SandboxBackend>,
    handle: SandboxHandle,
    stats: Arc<ProvisionerStats>,
    timeout: Duration,
) {
    stats.destroyed.fetch_add(1, Ordering::Relaxed);
    match tokio::time::timeout(timeout, backend.destroy(&handle)).await {
        Ok(Ok(())) => tracing::info!(sandbox_id = %handle.id, "Sandbox destroyed"),
        Ok(Err(e)) => {
            tracing::error!(sandbox_id = %handle.id, error = %e, "Failed to destroy sandbox")
        }
        Err(_) => tracing::error!(
            sandbox_id = %handle.id,
            timeout_ms = timeout.as_millis() as u64,
            "Sandbox teardown timed out"
        ),
    }
}

/// Destroys its sandbox when run, or from a spawned task when dropped.
struct Teardown {
    backend: Arc<dyn SandboxBackend>,
    handle: Option<SandboxHandle>,
    stats: Arc<ProvisionerStats>,
    timeout: Duration,
}

impl Teardown {
    async fn run(mut self) {
        if let Some(handle) = self.handle.take() {
            destroy_bounded(
                Arc::clone(&self.backend),
                handle,
                Arc::clone(&self.stats),
                self.timeout,
            )
            .await;
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(sandbox_id = %handle.id, "Step dropped, destroying sandbox in background");
                runtime.spawn(destroy_bounded(
                    Arc::clone(&self.backend),
                    handle,
                    Arc::clone(&self.stats),
                    self.timeout,
                ));
            }
            Err(_) => {
                tracing::error!(sandbox_id = %handle.id, "No runtime left, sandbox leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeBackend {
        images: std::sync::Mutex<Vec<String>>,
        create_image_calls: AtomicUsize,
        unavailable_creates: AtomicUsize,
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl SandboxBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn create_image(&self, spec: &ImageSpec) -> gitian_sandbox::Result<()> {
            self.create_image_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.images.lock().unwrap().push(spec.tag());
            Ok(())
        }

        async fn image_exists(&self, spec: &ImageSpec) -> gitian_sandbox::Result<bool> {
            Ok(self.images.lock().unwrap().contains(&spec.tag()))
        }

        async fn create(
            &self,
            image: &ImageSpec,
            _limits: &ResourceLimits,
            _mounts: &[Mount],
        ) -> gitian_sandbox::Result<SandboxHandle> {
            let remaining = self.unavailable_creates.load(Ordering::SeqCst);
            if remaining > 0 {
                self.unavailable_creates.store(remaining - 1, Ordering::SeqCst);
                return Err(BackendError::Unavailable("busy".into()));
            }
            Ok(SandboxHandle::new(image.clone()))
        }

        async fn run(
            &self,
            _handle: &SandboxHandle,
            _command: &SandboxCommand,
            _limits: &ResourceLimits,
            _output: OutputSender,
        ) -> gitian_sandbox::Result<i32> {
            Ok(0)
        }

        async fn copy_out(&self, _handle: &SandboxHandle, path: &str) -> gitian_sandbox::Result<Bytes> {
            Err(BackendError::PathNotFound(path.into()))
        }

        async fn copy_in(
            &self,
            _handle: &SandboxHandle,
            _path: &str,
            _contents: &[u8],
        ) -> gitian_sandbox::Result<()> {
            Ok(())
        }

        async fn destroy(&self, _handle: &SandboxHandle) -> gitian_sandbox::Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn base() -> BaseImage {
        BaseImage {
            distro: "ubuntu".into(),
            suite: "bionic".into(),
            arch: "amd64".into(),
            apt_cacher: false,
        }
    }

    fn provisioner(backend: Arc<FakeBackend>) -> SandboxProvisioner {
        SandboxProvisioner::new(
            backend,
            "1",
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
    }

    fn limits() -> ResourceLimits {
        ResourceLimits::new(2, 2000)
    }

    #[tokio::test]
    async fn test_concurrent_ensure_image_builds_once() {
        let backend = Arc::new(FakeBackend::default());
        let provisioner = provisioner(backend.clone());
        let slot = ImageSlot::Target(Target::Linux);

        let (base_a, base_b) = (base(), base());
        let (a, b) = tokio::join!(
            provisioner.ensure_image(slot, &base_a),
            provisioner.ensure_image(slot, &base_b)
        );
        assert_eq!(a.unwrap().tag(), "gitian-linux-bionic-amd64:1");
        assert!(b.is_ok());
        assert_eq!(backend.create_image_calls.load(Ordering::SeqCst), 1);

        provisioner.ensure_image(slot, &base()).await.unwrap();
        assert_eq!(backend.create_image_calls.load(Ordering::SeqCst), 1);
        assert!(provisioner.stats().image_cache_hits() >= 1);
    }

    #[tokio::test]
    async fn test_different_base_is_a_different_image() {
        let backend = Arc::new(FakeBackend::default());
        let provisioner = provisioner(backend.clone());
        let slot = ImageSlot::Target(Target::Linux);

        provisioner.ensure_image(slot, &base()).await.unwrap();
        let focal = BaseImage {
            suite: "focal".into(),
            ..base()
        };
        let spec = provisioner.ensure_image(slot, &focal).await.unwrap();
        assert_eq!(spec.suite, "focal");
        assert_eq!(backend.create_image_calls.load(Ordering::SeqCst), 2);

        let sandbox = provisioner.provision(slot, limits(), &[]).await.unwrap();
        assert_eq!(sandbox.handle().image.suite, "focal");
        provisioner.destroy(sandbox).await;

        provisioner.ensure_image(slot, &base()).await.unwrap();
        assert_eq!(backend.create_image_calls.load(Ordering::SeqCst), 2);
        let sandbox = provisioner.provision(slot, limits(), &[]).await.unwrap();
        assert_eq!(sandbox.handle().image.suite, "bionic");
        provisioner.destroy(sandbox).await;
    }

    #[tokio::test]
    async fn test_provision_without_setup_is_missing_image() {
        let provisioner = provisioner(Arc::new(FakeBackend::default()));
        let result = provisioner
            .provision(ImageSlot::Toolchain, limits(), &[])
            .await;
        assert!(matches!(result, Err(ProvisionError::MissingImage(_))));
    }

    #[tokio::test]
    async fn test_provision_retries_once() {
        let backend = Arc::new(FakeBackend::default());
        backend.unavailable_creates.store(1, Ordering::SeqCst);
        let provisioner = provisioner(backend.clone());
        provisioner.ensure_image(ImageSlot::Toolchain, &base()).await.unwrap();

        let sandbox = provisioner
            .provision(ImageSlot::Toolchain, limits(), &[])
            .await
            .expect("second attempt should succeed");
        assert_eq!(provisioner.stats().retries(), 1);
        provisioner.destroy(sandbox).await;

        backend.unavailable_creates.store(2, Ordering::SeqCst);
        let result = provisioner.provision(ImageSlot::Toolchain, limits(), &[]).await;
        assert!(matches!(result, Err(ProvisionError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_with_sandbox_destroys_on_error_and_panic() {
        let backend = Arc::new(FakeBackend::default());
        let provisioner = provisioner(backend.clone());
        let slot = ImageSlot::Target(Target::Windows);
        provisioner.ensure_image(slot, &base()).await.unwrap();
        let cancel = CancellationToken::new();

        let ok = provisioner
            .with_sandbox(slot, limits(), &[], &cancel, |sandbox| async move {
                Ok(sandbox.limits().threads)
            })
            .await;
        assert_eq!(ok.unwrap(), 2);

        let failed: Result<(), _> = provisioner
            .with_sandbox(slot, limits(), &[], &cancel, |_sandbox| async move {
                Err(StepError::Signing(crate::error::SigningError::Failed { exit_code: 2 }))
            })
            .await;
        assert!(matches!(failed, Err(StepError::Signing(_))));

        let panicked: Result<(), _> = provisioner
            .with_sandbox(slot, limits(), &[], &cancel, |_sandbox| async move {
                if slot == ImageSlot::Target(Target::Windows) {
                    panic!("boom");
                }
                Ok(())
            })
            .await;
        assert!(matches!(panicked, Err(StepError::Panicked(m)) if m == "boom"));

        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(provisioner.stats().provisioned(), provisioner.stats().destroyed());
    }

    #[tokio::test]
    async fn test_with_sandbox_cancellation_tears_down() {
        let backend = Arc::new(FakeBackend::default());
        let provisioner = provisioner(backend.clone());
        let slot = ImageSlot::Target(Target::MacOs);
        provisioner.ensure_image(slot, &base()).await.unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = provisioner
            .with_sandbox(slot, limits(), &[], &cancel, |_sandbox| async move {
                futures::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StepError::Cancelled)));
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_step_still_destroys() {
        let backend = Arc::new(FakeBackend::default());
        let provisioner = Arc::new(provisioner(backend.clone()));
        let slot = ImageSlot::Target(Target::Linux);
        provisioner.ensure_image(slot, &base()).await.unwrap();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let task = {
            let provisioner = Arc::clone(&provisioner);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let _ = provisioner
                    .with_sandbox(slot, limits(), &[], &cancel, |_sandbox| async move {
                        let _ = started_tx.send(());
                        futures::future::pending::<()>().await;
                        Ok(())
                    })
                    .await;
            })
        };
        started_rx.await.unwrap();
        task.abort();
        let _ = task.await;

        for _ in 0..50 {
            if backend.destroyed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
    }
}
